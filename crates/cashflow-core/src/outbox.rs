// Outbox event types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outbox row status
///
/// The relay deletes rows on successful publish, so in practice only
/// `Pending` rows exist. `Sent` and `Failed` are kept for stores that retain
/// rows for audit (see `PaymentStore::mark_outbox_event`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SENT" => Ok(Self::Sent),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("invalid outbox status: {other}")),
        }
    }
}

/// A row of the outbox table
///
/// `payload` is an opaque serialized snapshot; only the relay interprets it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub payload: Vec<u8>,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboxEvent {
    /// Extract the payment id the transport needs from the payload
    ///
    /// Returns a human-readable reason when the payload is unusable; such
    /// rows can never be published and are quarantined by the relay.
    pub fn correlation_id(&self) -> Result<Uuid, String> {
        let value: serde_json::Value = serde_json::from_slice(&self.payload)
            .map_err(|e| format!("malformed payload: {e}"))?;
        let id = value
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "payload missing payment id".to_string())?;
        Uuid::parse_str(id).map_err(|e| format!("payload has invalid payment id {id:?}: {e}"))
    }
}
