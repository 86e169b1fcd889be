//! PaymentStore trait definition
//!
//! The store is the single source of truth for payments and their outbox
//! events. Every mutation the relay or the status consumer performs happens
//! inside an explicit transaction that holds row locks until it ends.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::outbox::{OutboxEvent, OutboxStatus};
use crate::payment::{NewPayment, Payment, PaymentStatus};

/// An open store transaction
///
/// Dropping a transaction without calling [`commit`](Self::commit) rolls it
/// back and releases every row lock it holds.
#[async_trait]
pub trait StoreTransaction: Send + Sized {
    /// Commit all staged writes atomically
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard all staged writes
    async fn rollback(self) -> Result<(), StoreError>;
}

/// Transactional gateway over payments and outbox events
///
/// Implementations must be thread-safe and support concurrent access.
#[async_trait]
pub trait PaymentStore: Send + Sync + 'static {
    type Tx: StoreTransaction;

    /// Open a new transaction
    ///
    /// Fails with [`StoreError::ConnectionFailure`] when the store is unreachable.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Insert a payment and its outbox event in one transaction
    ///
    /// The outbox payload is the JSON snapshot of the inserted payment. Either
    /// both rows are committed or neither is.
    async fn create_payment_with_outbox(&self, payment: NewPayment) -> Result<Payment, StoreError>;

    /// Plain read outside any transaction
    async fn get_payment(&self, id: Uuid) -> Result<Payment, StoreError>;

    /// Read a payment and hold an exclusive lock on it until `tx` ends
    ///
    /// Blocks while another transaction holds the lock.
    async fn get_payment_for_update(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> Result<Payment, StoreError>;

    /// Unconditionally write a status inside `tx`
    ///
    /// Fails with [`StoreError::UnableToUpdate`] when no row was affected.
    async fn update_payment_status(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: PaymentStatus,
    ) -> Result<(), StoreError>;

    /// Lock up to `limit` pending outbox events, oldest first
    ///
    /// Rows already locked by other transactions are skipped, so concurrent
    /// relays never block each other.
    async fn lock_pending_outbox_events(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Delete an outbox event inside `tx`
    ///
    /// Fails with [`StoreError::ResourceNotFound`] if the row is already gone.
    async fn remove_outbox_event(&self, tx: &mut Self::Tx, id: Uuid) -> Result<(), StoreError>;

    /// Change an outbox event's status inside `tx`, keeping the row
    ///
    /// Fails with [`StoreError::ResourceNotFound`] if the row does not exist.
    async fn mark_outbox_event(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: OutboxStatus,
    ) -> Result<(), StoreError>;
}
