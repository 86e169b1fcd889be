//! PostgreSQL implementation of PaymentStore
//!
//! - Payment and outbox rows are inserted in one transaction
//! - Row locks via `FOR UPDATE`, non-blocking batch claims via `SKIP LOCKED`
//! - Outbox payloads are stored as JSONB and read back as text bytes

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use cashflow_core::{
    NewPayment, OutboxEvent, OutboxStatus, Payment, PaymentStatus, PaymentStore, StoreError,
    StoreTransaction,
};

const PAYMENT_COLUMNS: &str = "id, reference, amount, currency, status, created_at, updated_at";

/// Transaction handle for [`PostgresPaymentStore`]
///
/// Dropping it without committing rolls back on the connection.
pub struct PgTransaction(Transaction<'static, Postgres>);

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn commit(self) -> Result<(), StoreError> {
        self.0.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            StoreError::ConnectionFailure(e.to_string())
        })
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.0
            .rollback()
            .await
            .map_err(|e| StoreError::ConnectionFailure(e.to_string()))
    }
}

/// PostgreSQL implementation of PaymentStore
///
/// # Example
///
/// ```ignore
/// use cashflow_storage::PostgresPaymentStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/cashflow").await?;
/// let store = PostgresPaymentStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresPaymentStore {
    pool: PgPool,
}

impl PostgresPaymentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Internal(format!("failed to decode payment: {e}"));

    let currency: String = row.try_get("currency").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(Payment {
        id: row.try_get("id").map_err(decode)?,
        reference: row.try_get("reference").map_err(decode)?,
        amount: row.try_get("amount").map_err(decode)?,
        currency: currency.parse().map_err(StoreError::Internal)?,
        status: status.parse().map_err(StoreError::Internal)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn outbox_event_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Internal(format!("failed to decode outbox event: {e}"));

    let payload: String = row.try_get("payload").map_err(decode)?;
    let status: String = row.try_get("status").map_err(decode)?;

    Ok(OutboxEvent {
        id: row.try_get("id").map_err(decode)?,
        payload: payload.into_bytes(),
        status: status.parse().map_err(StoreError::Internal)?,
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

#[async_trait]
impl PaymentStore for PostgresPaymentStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<Self::Tx, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| {
            error!("Failed to begin transaction: {}", e);
            StoreError::ConnectionFailure(e.to_string())
        })?;
        Ok(PgTransaction(tx))
    }

    #[instrument(skip(self, payment), fields(reference = %payment.reference))]
    async fn create_payment_with_outbox(&self, payment: NewPayment) -> Result<Payment, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::UnableToCreate(format!("failed to begin transaction: {e}")))?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO payments (reference, amount, currency, status)
            VALUES ($1, $2, $3, $4)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.reference)
        .bind(payment.amount)
        .bind(payment.currency.as_str())
        .bind(payment.status.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::UnableToCreate(format!("duplicate payment reference {}", payment.reference))
            } else {
                error!("Failed to insert payment: {}", e);
                StoreError::UnableToCreate(e.to_string())
            }
        })?;
        let created = payment_from_row(&row)?;

        let payload = serde_json::to_string(&created)
            .map_err(|e| StoreError::Internal(format!("failed to serialize payment: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO outbox_events (payload, status)
            VALUES ($1::jsonb, 'PENDING')
            "#,
        )
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to save outbox event: {}", e);
            StoreError::UnableToCreate(format!("failed to save outbox event: {e}"))
        })?;

        tx.commit()
            .await
            .map_err(|e| StoreError::UnableToCreate(format!("failed to commit payment: {e}")))?;

        debug!(payment_id = %created.id, "created payment with outbox event");
        Ok(created)
    }

    #[instrument(skip(self))]
    async fn get_payment(&self, id: Uuid) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get payment: {}", e);
                StoreError::UnableToGet(e.to_string())
            })?
            .ok_or_else(|| StoreError::payment_not_found(id))?;

        payment_from_row(&row)
    }

    #[instrument(skip(self, tx))]
    async fn get_payment_for_update(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
    ) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx.0)
        .await
        .map_err(|e| {
            error!("Failed to lock payment: {}", e);
            StoreError::UnableToGet(e.to_string())
        })?
        .ok_or_else(|| StoreError::payment_not_found(id))?;

        payment_from_row(&row)
    }

    #[instrument(skip(self, tx))]
    async fn update_payment_status(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: PaymentStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx.0)
        .await
        .map_err(|e| {
            error!("Failed to update payment status: {}", e);
            StoreError::UnableToUpdate(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::UnableToUpdate(format!(
                "payment {id} not updated: no rows affected"
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, tx))]
    async fn lock_pending_outbox_events(
        &self,
        tx: &mut Self::Tx,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT id, payload::text AS payload, status, created_at, updated_at
            FROM outbox_events
            WHERE status = 'PENDING'
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *tx.0)
        .await
        .map_err(|e| {
            error!("Failed to lock pending outbox events: {}", e);
            StoreError::UnableToGet(e.to_string())
        })?;

        rows.iter().map(outbox_event_from_row).collect()
    }

    #[instrument(skip(self, tx))]
    async fn remove_outbox_event(&self, tx: &mut Self::Tx, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE id = $1")
            .bind(id)
            .execute(&mut *tx.0)
            .await
            .map_err(|e| {
                error!("Failed to delete outbox event: {}", e);
                StoreError::UnableToUpdate(e.to_string())
            })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::outbox_event_not_found(id));
        }
        Ok(())
    }

    #[instrument(skip(self, tx))]
    async fn mark_outbox_event(
        &self,
        tx: &mut Self::Tx,
        id: Uuid,
        status: OutboxStatus,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .execute(&mut *tx.0)
        .await
        .map_err(|e| {
            error!("Failed to mark outbox event: {}", e);
            StoreError::UnableToUpdate(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::outbox_event_not_found(id));
        }
        Ok(())
    }
}
