//! In-memory implementation of PaymentStore for testing
//!
//! Mirrors the PostgreSQL semantics the relay and consumer depend on:
//! exclusive row locks held for a transaction's lifetime, blocking
//! `FOR UPDATE` reads, skip-locked batch reads, and writes that become
//! visible only at commit.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use crate::error::StoreError;
use crate::outbox::{OutboxEvent, OutboxStatus};
use crate::payment::{NewPayment, Payment, PaymentStatus};
use crate::store::{PaymentStore, StoreTransaction};

#[derive(Default)]
struct Tables {
    payments: HashMap<Uuid, Payment>,
    references: HashSet<Uuid>,
    /// Insertion order is creation order
    outbox: Vec<OutboxEvent>,
}

/// Injected failures, consumed one at a time
#[derive(Default)]
struct Faults {
    begin: AtomicU32,
    commit: AtomicU32,
    outbox_insert: AtomicBool,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

enum StagedWrite {
    PaymentStatus { id: Uuid, status: PaymentStatus },
    RemoveOutbox(Uuid),
    MarkOutbox { id: Uuid, status: OutboxStatus },
}

#[derive(Default)]
struct Inner {
    tables: RwLock<Tables>,
    row_locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
    faults: Faults,
}

impl Inner {
    fn row_lock(&self, id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.row_locks.lock().entry(id).or_default().clone()
    }

    fn insert(&self, new: NewPayment) -> Result<Payment, StoreError> {
        let mut tables = self.tables.write();
        if tables.references.contains(&new.reference) {
            return Err(StoreError::UnableToCreate(format!(
                "duplicate payment reference {}",
                new.reference
            )));
        }

        let now = Utc::now();
        let payment = Payment {
            id: Uuid::new_v4(),
            reference: new.reference,
            amount: new.amount,
            currency: new.currency,
            status: new.status,
            created_at: now,
            updated_at: now,
        };
        let payload = serde_json::to_vec(&payment)
            .map_err(|e| StoreError::Internal(format!("failed to serialize payment: {e}")))?;

        if self.faults.outbox_insert.load(Ordering::SeqCst) {
            return Err(StoreError::UnableToCreate(
                "failed to save outbox event".to_string(),
            ));
        }

        tables.references.insert(payment.reference);
        tables.payments.insert(payment.id, payment.clone());
        tables.outbox.push(OutboxEvent {
            id: Uuid::new_v4(),
            payload,
            status: OutboxStatus::Pending,
            created_at: now,
            updated_at: now,
        });
        Ok(payment)
    }

    fn payment(&self, id: Uuid) -> Option<Payment> {
        self.tables.read().payments.get(&id).cloned()
    }

    fn outbox_event(&self, id: Uuid) -> Option<OutboxEvent> {
        self.tables.read().outbox.iter().find(|e| e.id == id).cloned()
    }

    fn pending_outbox(&self) -> Vec<OutboxEvent> {
        self.tables
            .read()
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending)
            .cloned()
            .collect()
    }

    fn apply(&self, staged: &[StagedWrite]) {
        let now = Utc::now();
        let mut tables = self.tables.write();
        for write in staged {
            match write {
                StagedWrite::PaymentStatus { id, status } => {
                    if let Some(payment) = tables.payments.get_mut(id) {
                        payment.status = *status;
                        payment.updated_at = now;
                    }
                }
                StagedWrite::RemoveOutbox(id) => tables.outbox.retain(|e| e.id != *id),
                StagedWrite::MarkOutbox { id, status } => {
                    if let Some(event) = tables.outbox.iter_mut().find(|e| e.id == *id) {
                        event.status = *status;
                        event.updated_at = now;
                    }
                }
            }
        }
    }
}

/// Transaction over an [`InMemoryPaymentStore`]
pub struct InMemoryTransaction {
    inner: Arc<Inner>,
    held: HashMap<Uuid, OwnedMutexGuard<()>>,
    staged: Vec<StagedWrite>,
}

impl InMemoryTransaction {
    async fn lock_row(&mut self, id: Uuid) {
        if self.held.contains_key(&id) {
            return;
        }
        let guard = self.inner.row_lock(id).lock_owned().await;
        self.held.insert(id, guard);
    }

    fn staged_payment_status(&self, id: Uuid) -> Option<PaymentStatus> {
        self.staged.iter().rev().find_map(|w| match w {
            StagedWrite::PaymentStatus { id: staged, status } if *staged == id => Some(*status),
            _ => None,
        })
    }

    fn is_removed(&self, id: Uuid) -> bool {
        self.staged
            .iter()
            .any(|w| matches!(w, StagedWrite::RemoveOutbox(removed) if *removed == id))
    }

    /// Number of row locks this transaction currently holds
    pub fn locked_rows(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        if take(&self.inner.faults.commit) {
            return Err(StoreError::ConnectionFailure(
                "injected commit failure".to_string(),
            ));
        }
        // Writes become visible before the row locks are released
        self.inner.apply(&self.staged);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory implementation of PaymentStore
///
/// Clones share the same underlying tables.
///
/// # Example
///
/// ```
/// use cashflow_core::InMemoryPaymentStore;
///
/// let store = InMemoryPaymentStore::new();
/// assert_eq!(store.outbox_count(), 0);
/// ```
#[derive(Clone, Default)]
pub struct InMemoryPaymentStore {
    inner: Arc<Inner>,
}

impl InMemoryPaymentStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of payments
    pub fn payment_count(&self) -> usize {
        self.inner.tables.read().payments.len()
    }

    /// Get the number of outbox rows
    pub fn outbox_count(&self) -> usize {
        self.inner.tables.read().outbox.len()
    }

    /// Snapshot of all outbox rows in creation order
    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.inner.tables.read().outbox.clone()
    }

    /// Number of outbox rows whose payload refers to `payment_id`
    pub fn outbox_count_for(&self, payment_id: Uuid) -> usize {
        self.inner
            .tables
            .read()
            .outbox
            .iter()
            .filter(|e| e.correlation_id().ok() == Some(payment_id))
            .count()
    }

    /// Insert an outbox row with an arbitrary payload (for poison-row tests)
    pub fn insert_outbox_payload(&self, payload: impl Into<Vec<u8>>) -> Uuid {
        let now = Utc::now();
        let id = Uuid::new_v4();
        self.inner.tables.write().outbox.push(OutboxEvent {
            id,
            payload: payload.into(),
            status: OutboxStatus::Pending,
            created_at: now,
            updated_at: now,
        });
        id
    }

    /// Make the next `count` calls to `begin` fail
    pub fn fail_next_begins(&self, count: u32) {
        self.inner.faults.begin.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` commits fail (their writes are discarded)
    pub fn fail_next_commits(&self, count: u32) {
        self.inner.faults.commit.store(count, Ordering::SeqCst);
    }

    /// Make outbox inserts during payment creation fail
    pub fn fail_outbox_inserts(&self, fail: bool) {
        self.inner.faults.outbox_insert.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentStore for InMemoryPaymentStore {
    type Tx = InMemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        if take(&self.inner.faults.begin) {
            return Err(StoreError::ConnectionFailure(
                "injected begin failure".to_string(),
            ));
        }
        Ok(InMemoryTransaction {
            inner: Arc::clone(&self.inner),
            held: HashMap::new(),
            staged: Vec::new(),
        })
    }

    async fn create_payment_with_outbox(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        self.inner.insert(payment)
    }

    async fn get_payment(&self, id: Uuid) -> Result<Payment, StoreError> {
        self.inner
            .payment(id)
            .ok_or_else(|| StoreError::payment_not_found(id))
    }

    async fn get_payment_for_update(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> Result<Payment, StoreError> {
        tx.lock_row(id).await;
        match self.inner.payment(id) {
            Some(mut payment) => {
                if let Some(status) = tx.staged_payment_status(id) {
                    payment.status = status;
                }
                Ok(payment)
            }
            None => {
                tx.held.remove(&id);
                Err(StoreError::payment_not_found(id))
            }
        }
    }

    async fn update_payment_status(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        tx.lock_row(id).await;
        if self.inner.payment(id).is_none() {
            return Err(StoreError::UnableToUpdate(format!(
                "payment {id} not updated: no rows affected"
            )));
        }
        tx.staged.push(StagedWrite::PaymentStatus { id, status });
        Ok(())
    }

    async fn lock_pending_outbox_events(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut locked = Vec::new();
        for candidate in self.inner.pending_outbox() {
            if locked.len() >= limit {
                break;
            }
            if tx.is_removed(candidate.id) {
                continue;
            }
            if tx.held.contains_key(&candidate.id) {
                locked.push(candidate);
                continue;
            }
            let Ok(guard) = self.inner.row_lock(candidate.id).try_lock_owned() else {
                continue;
            };
            // The row may have been removed between the snapshot and the lock
            match self.inner.outbox_event(candidate.id) {
                Some(current) if current.status == OutboxStatus::Pending => {
                    tx.held.insert(current.id, guard);
                    locked.push(current);
                }
                _ => drop(guard),
            }
        }
        Ok(locked)
    }

    async fn remove_outbox_event(&self, tx: &mut Self::Tx, id: Uuid) -> Result<(), StoreError> {
        tx.lock_row(id).await;
        if tx.is_removed(id) || self.inner.outbox_event(id).is_none() {
            return Err(StoreError::outbox_event_not_found(id));
        }
        tx.staged.push(StagedWrite::RemoveOutbox(id));
        Ok(())
    }

    async fn mark_outbox_event(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: OutboxStatus,
    ) -> Result<(), StoreError> {
        tx.lock_row(id).await;
        if tx.is_removed(id) || self.inner.outbox_event(id).is_none() {
            return Err(StoreError::outbox_event_not_found(id));
        }
        tx.staged.push(StagedWrite::MarkOutbox { id, status });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::PaymentCurrency;
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn new_payment() -> NewPayment {
        NewPayment {
            reference: Uuid::new_v4(),
            amount: dec!(100000),
            currency: PaymentCurrency::Etb,
            status: PaymentStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_create_writes_payment_and_outbox_together() {
        let store = InMemoryPaymentStore::new();
        let payment = store.create_payment_with_outbox(new_payment()).await.unwrap();

        assert_eq!(payment.status, PaymentStatus::Pending);
        assert_eq!(store.payment_count(), 1);
        assert_eq!(store.outbox_count_for(payment.id), 1);

        let snapshot: Payment =
            serde_json::from_slice(&store.outbox_events()[0].payload).unwrap();
        assert_eq!(snapshot, payment);
    }

    #[tokio::test]
    async fn test_failed_outbox_insert_leaves_nothing() {
        let store = InMemoryPaymentStore::new();
        store.fail_outbox_inserts(true);

        let err = store
            .create_payment_with_outbox(new_payment())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnableToCreate(_)));
        assert_eq!(store.payment_count(), 0);
        assert_eq!(store.outbox_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let store = InMemoryPaymentStore::new();
        let payment = new_payment();
        store.create_payment_with_outbox(payment.clone()).await.unwrap();

        let err = store.create_payment_with_outbox(payment).await.unwrap_err();
        assert!(matches!(err, StoreError::UnableToCreate(_)));
        assert_eq!(store.payment_count(), 1);
        assert_eq!(store.outbox_count(), 1);
    }

    #[tokio::test]
    async fn test_get_missing_payment() {
        let store = InMemoryPaymentStore::new();
        let err = store.get_payment(Uuid::new_v4()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_status_update_visible_only_after_commit() {
        let store = InMemoryPaymentStore::new();
        let payment = store.create_payment_with_outbox(new_payment()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        store
            .update_payment_status(&mut tx, payment.id, PaymentStatus::Success)
            .await
            .unwrap();
        // Own writes are visible inside the transaction
        let locked = store.get_payment_for_update(&mut tx, payment.id).await.unwrap();
        assert_eq!(locked.status, PaymentStatus::Success);
        assert_eq!(
            store.get_payment(payment.id).await.unwrap().status,
            PaymentStatus::Pending
        );

        tx.commit().await.unwrap();
        assert_eq!(
            store.get_payment(payment.id).await.unwrap().status,
            PaymentStatus::Success
        );
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryPaymentStore::new();
        store.create_payment_with_outbox(new_payment()).await.unwrap();

        {
            let mut tx = store.begin().await.unwrap();
            let events = store.lock_pending_outbox_events(&mut tx, 10).await.unwrap();
            store.remove_outbox_event(&mut tx, events[0].id).await.unwrap();
        }

        assert_eq!(store.outbox_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_discards_writes() {
        let store = InMemoryPaymentStore::new();
        store.create_payment_with_outbox(new_payment()).await.unwrap();
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        let events = store.lock_pending_outbox_events(&mut tx, 10).await.unwrap();
        store.remove_outbox_event(&mut tx, events[0].id).await.unwrap();
        assert!(tx.commit().await.is_err());

        assert_eq!(store.outbox_count(), 1);

        // The failed commit released its locks
        let mut tx = store.begin().await.unwrap();
        let events = store.lock_pending_outbox_events(&mut tx, 10).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_pending_skips_rows_locked_elsewhere() {
        let store = InMemoryPaymentStore::new();
        for _ in 0..3 {
            store.create_payment_with_outbox(new_payment()).await.unwrap();
        }

        let mut first = store.begin().await.unwrap();
        let first_batch = store.lock_pending_outbox_events(&mut first, 2).await.unwrap();
        assert_eq!(first_batch.len(), 2);

        let mut second = store.begin().await.unwrap();
        let second_batch = store.lock_pending_outbox_events(&mut second, 10).await.unwrap();
        assert_eq!(second_batch.len(), 1);
        assert!(first_batch.iter().all(|e| e.id != second_batch[0].id));
        assert_eq!(first.locked_rows(), 2);
        assert_eq!(second.locked_rows(), 1);
    }

    #[tokio::test]
    async fn test_lock_pending_preserves_creation_order() {
        let store = InMemoryPaymentStore::new();
        let mut ids = Vec::new();
        for _ in 0..4 {
            ids.push(store.create_payment_with_outbox(new_payment()).await.unwrap().id);
        }

        let mut tx = store.begin().await.unwrap();
        let locked: Vec<Uuid> = store
            .lock_pending_outbox_events(&mut tx, 10)
            .await
            .unwrap()
            .iter()
            .map(|e| e.correlation_id().unwrap())
            .collect();
        assert_eq!(locked, ids);
    }

    #[tokio::test]
    async fn test_for_update_blocks_until_holder_finishes() {
        let store = InMemoryPaymentStore::new();
        let payment = store.create_payment_with_outbox(new_payment()).await.unwrap();

        let mut holder = store.begin().await.unwrap();
        store.get_payment_for_update(&mut holder, payment.id).await.unwrap();

        let contender_store = store.clone();
        let contender = tokio::spawn(async move {
            let mut tx = contender_store.begin().await.unwrap();
            contender_store
                .get_payment_for_update(&mut tx, payment.id)
                .await
                .unwrap()
                .status
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        store
            .update_payment_status(&mut holder, payment.id, PaymentStatus::Failed)
            .await
            .unwrap();
        holder.commit().await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn test_remove_twice_is_not_found() {
        let store = InMemoryPaymentStore::new();
        store.create_payment_with_outbox(new_payment()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let events = store.lock_pending_outbox_events(&mut tx, 10).await.unwrap();
        store.remove_outbox_event(&mut tx, events[0].id).await.unwrap();
        let err = store
            .remove_outbox_event(&mut tx, events[0].id)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_missing_payment_fails() {
        let store = InMemoryPaymentStore::new();
        let mut tx = store.begin().await.unwrap();
        let err = store
            .update_payment_status(&mut tx, Uuid::new_v4(), PaymentStatus::Success)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UnableToUpdate(_)));
    }

    #[tokio::test]
    async fn test_marked_outbox_event_is_no_longer_pending() {
        let store = InMemoryPaymentStore::new();
        store.create_payment_with_outbox(new_payment()).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let events = store.lock_pending_outbox_events(&mut tx, 10).await.unwrap();
        store
            .mark_outbox_event(&mut tx, events[0].id, OutboxStatus::Sent)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert_eq!(store.outbox_count(), 1);
        assert_eq!(store.outbox_events()[0].status, OutboxStatus::Sent);
        let mut tx = store.begin().await.unwrap();
        assert!(store
            .lock_pending_outbox_events(&mut tx, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_injected_begin_failure() {
        let store = InMemoryPaymentStore::new();
        store.fail_next_begins(1);
        assert!(matches!(
            store.begin().await,
            Err(StoreError::ConnectionFailure(_))
        ));
        assert!(store.begin().await.is_ok());
    }
}
