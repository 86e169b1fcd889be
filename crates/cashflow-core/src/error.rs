// Error taxonomy shared by the storage gateway and the creation path

use uuid::Uuid;

/// Error type for storage operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    /// An insert failed; nothing from the operation was persisted
    #[error("unable to create: {0}")]
    UnableToCreate(String),

    /// A read failed for a reason other than absence
    #[error("unable to get: {0}")]
    UnableToGet(String),

    /// A write affected no rows or was rejected
    #[error("unable to update: {0}")]
    UnableToUpdate(String),

    /// The store could not be reached or a transaction could not be opened or committed
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    /// Serialization or other internal failure
    #[error("internal error: {0}")]
    Internal(String),
}

impl StoreError {
    pub fn payment_not_found(id: Uuid) -> Self {
        Self::ResourceNotFound(format!("payment {id}"))
    }

    pub fn outbox_event_not_found(id: Uuid) -> Self {
        Self::ResourceNotFound(format!("outbox event {id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound(_))
    }
}

/// Errors surfaced by the payment creation path
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    /// Caller error; never retried
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("payment not found: {0}")]
    ResourceNotFound(Uuid),

    #[error("unable to create payment: {0}")]
    UnableToCreate(#[source] StoreError),

    #[error("unable to get payment: {0}")]
    UnableToGet(#[source] StoreError),
}
