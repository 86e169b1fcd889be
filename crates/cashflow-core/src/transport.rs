//! Message transport abstraction
//!
//! The relay publishes status-update messages and the consumer receives
//! them. Delivery is at-least-once: a message is only gone once the
//! consumer acknowledges it.

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Body of a status-update message: `{"payment_id": "<uuid>"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateMessage {
    pub payment_id: Uuid,
}

impl StatusUpdateMessage {
    pub fn new(payment_id: Uuid) -> Self {
        Self { payment_id }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, TransportError> {
        serde_json::to_vec(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    pub fn from_bytes(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("consume failed: {0}")]
    Consume(String),

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("transport closed")]
    Closed,
}

/// A single received message awaiting settlement
#[async_trait]
pub trait Delivery: Send {
    fn body(&self) -> &[u8];

    /// Settle the message; it will not be redelivered
    async fn ack(self: Box<Self>) -> Result<(), TransportError>;

    /// Return the message to the queue for redelivery
    async fn nack_requeue(self: Box<Self>) -> Result<(), TransportError>;

    /// Reject the message without redelivery
    async fn nack_drop(self: Box<Self>) -> Result<(), TransportError>;
}

pub type DeliveryStream = BoxStream<'static, Result<Box<dyn Delivery>, TransportError>>;

#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Publish a status update for `payment_id`
    ///
    /// Returns only after the broker has accepted the message.
    async fn publish(&self, payment_id: Uuid) -> Result<(), TransportError>;

    /// Start consuming deliveries with manual acknowledgement
    async fn consume(&self) -> Result<DeliveryStream, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
