//! Outbox relay
//!
//! Each cycle runs in one transaction: lock a batch of pending outbox rows,
//! publish each, delete it, and commit only when every row was handled.
//! Any publish or delete failure drops the transaction, so no row is ever
//! removed without an observed successful publish.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use cashflow_core::{MessageTransport, PaymentStore, StoreError, StoreTransaction, TransportError};

/// Shortest polling period; `tokio::time::interval` rejects zero
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Relay configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// Time between polling cycles
    pub interval: Duration,

    /// Maximum rows locked per cycle
    pub batch_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            batch_size: 100,
        }
    }
}

impl RelayConfig {
    /// Zero is raised to the one millisecond minimum
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

/// Outcome of one successful cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub locked: usize,
    pub published: usize,
    pub quarantined: usize,
}

/// Why a cycle was abandoned; every staged delete was rolled back
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to begin relay transaction: {0}")]
    Begin(#[source] StoreError),

    #[error("failed to lock pending outbox events: {0}")]
    Lock(#[source] StoreError),

    #[error("failed to publish outbox event {event_id}: {source}")]
    Publish {
        event_id: Uuid,
        #[source]
        source: TransportError,
    },

    #[error("failed to remove outbox event {event_id}: {source}")]
    Remove {
        event_id: Uuid,
        #[source]
        source: StoreError,
    },

    #[error("failed to commit relay transaction: {0}")]
    Commit(#[source] StoreError),
}

pub struct OutboxRelay<S: PaymentStore> {
    store: Arc<S>,
    transport: Arc<dyn MessageTransport>,
    config: RelayConfig,
}

impl<S: PaymentStore> OutboxRelay<S> {
    pub fn new(store: Arc<S>, transport: Arc<dyn MessageTransport>, config: RelayConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Run a single polling cycle
    #[instrument(skip(self), fields(batch_size = self.config.batch_size))]
    pub async fn run_once(&self) -> Result<CycleReport, RelayError> {
        let mut tx = self.store.begin().await.map_err(RelayError::Begin)?;

        let events = self
            .store
            .lock_pending_outbox_events(&mut tx, self.config.batch_size)
            .await
            .map_err(RelayError::Lock)?;

        let mut report = CycleReport {
            locked: events.len(),
            ..Default::default()
        };

        for event in events {
            let payment_id = match event.correlation_id() {
                Ok(id) => id,
                Err(reason) => {
                    warn!(event_id = %event.id, %reason, "Quarantining unpublishable outbox event");
                    self.store
                        .remove_outbox_event(&mut tx, event.id)
                        .await
                        .map_err(|source| RelayError::Remove {
                            event_id: event.id,
                            source,
                        })?;
                    report.quarantined += 1;
                    continue;
                }
            };

            self.transport
                .publish(payment_id)
                .await
                .map_err(|source| RelayError::Publish {
                    event_id: event.id,
                    source,
                })?;

            self.store
                .remove_outbox_event(&mut tx, event.id)
                .await
                .map_err(|source| RelayError::Remove {
                    event_id: event.id,
                    source,
                })?;

            debug!(event_id = %event.id, %payment_id, "Published outbox event");
            report.published += 1;
        }

        tx.commit().await.map_err(RelayError::Commit)?;
        Ok(report)
    }

    /// Poll on the configured interval until `cancel` fires
    ///
    /// A cycle in progress always runs to completion.
    pub async fn run(&self, cancel: CancellationToken) {
        // The field is public, so the builder's clamp may have been bypassed
        let period = self.config.interval.max(MIN_INTERVAL);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = period.as_millis() as u64,
            batch_size = self.config.batch_size,
            "Outbox relay started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.run_once().await {
                    Ok(report) if report.locked > 0 => info!(
                        published = report.published,
                        quarantined = report.quarantined,
                        "Outbox cycle committed"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Outbox cycle rolled back"),
                },
            }
        }

        info!("Outbox relay stopped");
    }
}
