//! In-process MessageTransport backed by an unbounded channel
//!
//! Records every publish and settlement so tests can assert on delivery
//! behavior without a broker.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

use crate::transport::{
    Delivery, DeliveryStream, MessageTransport, StatusUpdateMessage, TransportError,
};

/// How a delivery was settled by the consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Drop,
}

#[derive(Default)]
struct Shared {
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    published: Mutex<Vec<Uuid>>,
    settlements: Mutex<Vec<(Vec<u8>, Settlement)>>,
    settled: Notify,
    fail_publishes: AtomicU32,
}

impl Shared {
    fn send(&self, body: Vec<u8>) -> Result<(), TransportError> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(TransportError::Closed)?;
        sender.send(body).map_err(|_| TransportError::Closed)
    }

    fn settle(&self, body: Vec<u8>, settlement: Settlement) {
        self.settlements.lock().push((body, settlement));
        self.settled.notify_waiters();
    }
}

struct InMemoryDelivery {
    body: Vec<u8>,
    shared: Arc<Shared>,
}

#[async_trait]
impl Delivery for InMemoryDelivery {
    fn body(&self) -> &[u8] {
        &self.body
    }

    async fn ack(self: Box<Self>) -> Result<(), TransportError> {
        let Self { body, shared } = *self;
        shared.settle(body, Settlement::Ack);
        Ok(())
    }

    async fn nack_requeue(self: Box<Self>) -> Result<(), TransportError> {
        let Self { body, shared } = *self;
        shared.send(body.clone())?;
        shared.settle(body, Settlement::Requeue);
        Ok(())
    }

    async fn nack_drop(self: Box<Self>) -> Result<(), TransportError> {
        let Self { body, shared } = *self;
        shared.settle(body, Settlement::Drop);
        Ok(())
    }
}

/// Channel-backed transport for tests and local runs
///
/// Clones share the same queue.
#[derive(Clone)]
pub struct InMemoryTransport {
    shared: Arc<Shared>,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Shared {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            ..Default::default()
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Enqueue a raw body, bypassing `publish`
    pub fn inject(&self, body: impl Into<Vec<u8>>) -> Result<(), TransportError> {
        self.shared.send(body.into())
    }

    /// Make the next `count` publishes fail
    pub fn fail_next_publishes(&self, count: u32) {
        self.shared.fail_publishes.store(count, Ordering::SeqCst);
    }

    /// Payment ids accepted by `publish`, in order
    pub fn published(&self) -> Vec<Uuid> {
        self.shared.published.lock().clone()
    }

    /// Every settlement so far, in order
    pub fn settlements(&self) -> Vec<(Vec<u8>, Settlement)> {
        self.shared.settlements.lock().clone()
    }

    pub fn settlement_count(&self, kind: Settlement) -> usize {
        self.shared
            .settlements
            .lock()
            .iter()
            .filter(|(_, s)| *s == kind)
            .count()
    }

    /// Wait until at least `count` deliveries have been settled
    pub async fn wait_for_settlements(&self, count: usize) {
        loop {
            let notified = self.shared.settled.notified();
            if self.shared.settlements.lock().len() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl MessageTransport for InMemoryTransport {
    async fn publish(&self, payment_id: Uuid) -> Result<(), TransportError> {
        let injected = self
            .shared
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::Publish(
                "injected publish failure".to_string(),
            ));
        }

        let body = StatusUpdateMessage::new(payment_id).to_bytes()?;
        self.shared.send(body)?;
        self.shared.published.lock().push(payment_id);
        Ok(())
    }

    async fn consume(&self) -> Result<DeliveryStream, TransportError> {
        let receiver = self
            .shared
            .receiver
            .lock()
            .take()
            .ok_or_else(|| TransportError::Consume("queue already has a consumer".to_string()))?;

        let shared = Arc::clone(&self.shared);
        let stream = UnboundedReceiverStream::new(receiver).map(move |body| {
            let delivery = InMemoryDelivery {
                body,
                shared: Arc::clone(&shared),
            };
            Ok(Box::new(delivery) as Box<dyn Delivery>)
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.sender.lock().take();
        Ok(())
    }
}
