//! Bounded task pool
//!
//! A fixed set of workers drains one bounded queue. Submitters wait for
//! queue capacity instead of failing, and keyed submissions share a
//! per-key admission limit.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

const DEFAULT_WORKERS: usize = 100;
const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Task pool configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskPoolConfig {
    /// Number of long-lived workers
    pub workers: usize,

    /// Tasks that may wait in the queue before submitters block
    pub queue_capacity: usize,
}

impl Default for TaskPoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl TaskPoolConfig {
    /// Zero falls back to the default for either value
    pub fn new(workers: usize, queue_capacity: usize) -> Self {
        Self::default()
            .with_workers(workers)
            .with_queue_capacity(queue_capacity)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = if workers == 0 { DEFAULT_WORKERS } else { workers };
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = if capacity == 0 {
            DEFAULT_QUEUE_CAPACITY
        } else {
            capacity
        };
        self
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PoolError {
    /// The pool was stopped; no further tasks are accepted
    #[error("task pool is closed")]
    Closed,
}

/// Snapshot of pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub completed: u64,
    pub panicked: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    panicked: AtomicU64,
}

/// Fixed-size worker pool over a bounded queue
///
/// # Example
///
/// ```ignore
/// let pool = TaskPool::new(TaskPoolConfig::new(4, 64));
/// pool.start();
/// pool.submit_with_key("payment-status", 2, async { /* ... */ }).await?;
/// pool.stop().await;
/// ```
pub struct TaskPool {
    config: TaskPoolConfig,
    sender: RwLock<Option<mpsc::Sender<Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    key_limits: DashMap<String, Arc<Semaphore>>,
    counters: Arc<Counters>,
}

impl TaskPool {
    pub fn new(config: TaskPoolConfig) -> Self {
        let config = TaskPoolConfig::new(config.workers, config.queue_capacity);
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        Self {
            config,
            sender: RwLock::new(Some(tx)),
            receiver: Arc::new(tokio::sync::Mutex::new(rx)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            key_limits: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Launch the workers; calling it again has no effect
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting task pool"
        );

        let mut workers = self.workers.lock();
        for worker_id in 0..self.config.workers {
            let receiver = Arc::clone(&self.receiver);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = receiver.lock().await.recv().await;
                    match job {
                        Some(job) => job.await,
                        None => break,
                    }
                }
                debug!(worker_id, "Task pool worker exiting");
            }));
        }
    }

    /// Enqueue a task, waiting while the queue is full
    pub async fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let counters = Arc::clone(&self.counters);
        self.enqueue(Box::pin(guarded(None, counters, task))).await
    }

    /// Enqueue a task that runs only while holding one of `max_concurrent`
    /// slots shared by every task submitted under `key`
    ///
    /// The slot count is fixed by the first submission for a key.
    pub async fn submit_with_key<F>(
        &self,
        key: &str,
        max_concurrent: usize,
        task: F,
    ) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self
            .key_limits
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(max_concurrent.max(1))))
            .clone();

        let counters = Arc::clone(&self.counters);
        let key = key.to_string();
        let job = async move {
            // Held until the guarded task returns or panics
            let _permit = semaphore.acquire_owned().await.ok();
            guarded(Some(key), counters, task).await;
        };
        self.enqueue(Box::pin(job)).await
    }

    async fn enqueue(&self, job: Job) -> Result<(), PoolError> {
        let sender = self.sender.read().clone().ok_or(PoolError::Closed)?;
        sender.send(job).await.map_err(|_| PoolError::Closed)
    }

    /// Close the queue and wait for the workers to drain it
    ///
    /// A pool that was never started is started here, so queued tasks and
    /// submitters waiting on a full queue still complete.
    pub async fn stop(&self) {
        self.start();
        self.sender.write().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Task pool worker failed");
            }
        }
        info!(stats = ?self.stats(), "Task pool stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.sender.read().is_none()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            completed: self.counters.completed.load(Ordering::Relaxed),
            panicked: self.counters.panicked.load(Ordering::Relaxed),
        }
    }
}

async fn guarded<F>(key: Option<String>, counters: Arc<Counters>, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match AssertUnwindSafe(task).catch_unwind().await {
        Ok(()) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
        }
        Err(panic) => {
            counters.panicked.fetch_add(1, Ordering::Relaxed);
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(key = key.as_deref().unwrap_or("-"), panic = %message, "Pooled task panicked");
        }
    }
}
