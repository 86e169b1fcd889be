//! Payment status consumer
//!
//! Applies status-update messages under a row lock. The PENDING check
//! inside the lock makes redelivery and concurrent delivery of the same
//! message harmless, and the message is acknowledged only after commit.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Span};
use uuid::Uuid;

use cashflow_core::{
    Delivery, MessageTransport, PaymentStatus, PaymentStore, StatusUpdateMessage,
    StoreTransaction, TransportError,
};

use crate::decider::OutcomeDecider;
use crate::pool::TaskPool;

/// Back-to-back stream errors tolerated before `run` gives up
pub const MAX_CONSECUTIVE_STREAM_ERRORS: u32 = 10;

fn decode(body: &[u8]) -> Result<Uuid, MessageOutcome> {
    StatusUpdateMessage::from_bytes(body)
        .map(|message| message.payment_id)
        .map_err(|e| MessageOutcome::Poison(format!("malformed status update: {e}")))
}

/// Consumer configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Task pool key shared by every status update
    pub partition_key: String,

    /// Status updates allowed to run at once under `partition_key`
    pub max_in_flight: usize,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            partition_key: "payment-status".to_string(),
            max_in_flight: 10,
        }
    }
}

impl ConsumerConfig {
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight.max(1);
        self
    }
}

/// How a message was handled, and therefore how it is settled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Status written and committed; ack
    Applied(PaymentStatus),
    /// Payment already terminal; ack without writing
    Duplicate(PaymentStatus),
    /// Body can never be processed; nack without requeue
    Poison(String),
    /// Transient failure; nack with requeue
    Retry(String),
}

pub struct PaymentStatusConsumer<S: PaymentStore> {
    store: Arc<S>,
    transport: Arc<dyn MessageTransport>,
    decider: Arc<dyn OutcomeDecider>,
    pool: Option<Arc<TaskPool>>,
    config: ConsumerConfig,
}

impl<S: PaymentStore> Clone for PaymentStatusConsumer<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            decider: Arc::clone(&self.decider),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: PaymentStore> PaymentStatusConsumer<S> {
    pub fn new(
        store: Arc<S>,
        transport: Arc<dyn MessageTransport>,
        decider: Arc<dyn OutcomeDecider>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            transport,
            decider,
            pool: None,
            config,
        }
    }

    /// Fan deliveries out to `pool` instead of handling them inline
    pub fn with_pool(mut self, pool: Arc<TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Apply one message body; never settles the delivery
    pub async fn process(&self, body: &[u8]) -> MessageOutcome {
        match decode(body) {
            Ok(payment_id) => self.apply(payment_id).await,
            Err(poison) => poison,
        }
    }

    #[instrument(skip(self))]
    async fn apply(&self, payment_id: Uuid) -> MessageOutcome {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                return MessageOutcome::Retry(format!(
                    "failed to begin transaction for payment {payment_id}: {e}"
                ))
            }
        };

        let payment = match self.store.get_payment_for_update(&mut tx, payment_id).await {
            Ok(payment) => payment,
            Err(e) => {
                return MessageOutcome::Retry(format!("failed to lock payment {payment_id}: {e}"))
            }
        };

        if payment.status.is_terminal() {
            return MessageOutcome::Duplicate(payment.status);
        }

        let status = self.decider.decide(&payment);

        if let Err(e) = self
            .store
            .update_payment_status(&mut tx, payment_id, status)
            .await
        {
            return MessageOutcome::Retry(format!("failed to update payment {payment_id}: {e}"));
        }

        if let Err(e) = tx.commit().await {
            return MessageOutcome::Retry(format!("failed to commit payment {payment_id}: {e}"));
        }

        MessageOutcome::Applied(status)
    }

    /// Process a delivery and settle it according to the outcome
    #[instrument(skip_all, fields(payment_id = tracing::field::Empty))]
    pub async fn handle(&self, delivery: Box<dyn Delivery>) -> MessageOutcome {
        let decoded = decode(delivery.body());
        let outcome = match decoded {
            Ok(payment_id) => {
                Span::current().record("payment_id", tracing::field::display(payment_id));
                self.apply(payment_id).await
            }
            Err(poison) => poison,
        };

        let settled = match &outcome {
            MessageOutcome::Applied(status) => {
                info!(%status, "Payment status applied");
                delivery.ack().await
            }
            MessageOutcome::Duplicate(status) => {
                debug!(%status, "Payment already terminal, acknowledging duplicate");
                delivery.ack().await
            }
            MessageOutcome::Poison(reason) => {
                warn!(%reason, body_len = delivery.body().len(), "Dropping poison status update");
                delivery.nack_drop().await
            }
            MessageOutcome::Retry(reason) => {
                warn!(%reason, "Requeueing status update");
                delivery.nack_requeue().await
            }
        };

        if let Err(e) = settled {
            error!(error = %e, ?outcome, "Failed to settle delivery");
        }
        outcome
    }

    /// Consume until `cancel` fires
    ///
    /// A message already being handled runs to completion. The stream
    /// ending, or failing `MAX_CONSECUTIVE_STREAM_ERRORS` times in a row,
    /// is an error: the caller decides whether to restart or exit.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TransportError>
    where
        S::Tx: 'static,
    {
        let mut deliveries = self.transport.consume().await?;
        info!(
            partition_key = %self.config.partition_key,
            max_in_flight = self.config.max_in_flight,
            pooled = self.pool.is_some(),
            "Payment status consumer started"
        );

        let mut stream_errors = 0;
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => {
                    stream_errors = 0;
                    delivery
                }
                Some(Err(e)) => {
                    stream_errors += 1;
                    error!(error = %e, stream_errors, "Failed to receive delivery");
                    if stream_errors >= MAX_CONSECUTIVE_STREAM_ERRORS {
                        return Err(e);
                    }
                    continue;
                }
                None => {
                    error!("Delivery stream closed while consuming");
                    return Err(TransportError::Closed);
                }
            };

            match &self.pool {
                Some(pool) => {
                    let consumer = self.clone();
                    let submitted = pool
                        .submit_with_key(
                            &self.config.partition_key,
                            self.config.max_in_flight,
                            async move {
                                consumer.handle(delivery).await;
                            },
                        )
                        .await;
                    if let Err(e) = submitted {
                        warn!(error = %e, "Task pool closed, stopping consumer");
                        break;
                    }
                }
                None => {
                    self.handle(delivery).await;
                }
            }
        }

        info!("Payment status consumer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decider::FixedOutcome;
    use cashflow_core::{
        InMemoryPaymentStore, InMemoryTransport, NewPayment, PaymentCurrency, Settlement,
    };
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn consumer(
        store: &InMemoryPaymentStore,
        transport: &InMemoryTransport,
        status: PaymentStatus,
    ) -> PaymentStatusConsumer<InMemoryPaymentStore> {
        PaymentStatusConsumer::new(
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
            Arc::new(FixedOutcome(status)),
            ConsumerConfig::default(),
        )
    }

    async fn pending_payment(store: &InMemoryPaymentStore) -> Uuid {
        store
            .create_payment_with_outbox(NewPayment {
                reference: Uuid::new_v4(),
                amount: dec!(250.75),
                currency: PaymentCurrency::Usd,
                status: PaymentStatus::Pending,
            })
            .await
            .unwrap()
            .id
    }

    fn body(payment_id: Uuid) -> Vec<u8> {
        StatusUpdateMessage::new(payment_id).to_bytes().unwrap()
    }

    #[tokio::test]
    async fn test_applies_terminal_status() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;

        let outcome = consumer(&store, &transport, PaymentStatus::Success)
            .process(&body(id))
            .await;

        assert_eq!(outcome, MessageOutcome::Applied(PaymentStatus::Success));
        assert_eq!(
            store.get_payment(id).await.unwrap().status,
            PaymentStatus::Success
        );
    }

    #[tokio::test]
    async fn test_second_delivery_is_duplicate() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;

        consumer(&store, &transport, PaymentStatus::Failed)
            .process(&body(id))
            .await;
        // A different decision on redelivery must not overwrite the first
        let outcome = consumer(&store, &transport, PaymentStatus::Success)
            .process(&body(id))
            .await;

        assert_eq!(outcome, MessageOutcome::Duplicate(PaymentStatus::Failed));
        assert_eq!(
            store.get_payment(id).await.unwrap().status,
            PaymentStatus::Failed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_deliveries_apply_once() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;
        let consumer = consumer(&store, &transport, PaymentStatus::Success);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let consumer = consumer.clone();
                let body = body(id);
                tokio::spawn(async move { consumer.process(&body).await })
            })
            .collect();

        let mut applied = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                MessageOutcome::Applied(_) => applied += 1,
                MessageOutcome::Duplicate(_) => duplicates += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(applied, 1);
        assert_eq!(duplicates, 7);
    }

    #[tokio::test]
    async fn test_malformed_body_is_poison() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let consumer = consumer(&store, &transport, PaymentStatus::Success);

        assert!(matches!(
            consumer.process(b"not json").await,
            MessageOutcome::Poison(_)
        ));
        assert!(matches!(
            consumer.process(br#"{"payment_id": "nope"}"#).await,
            MessageOutcome::Poison(_)
        ));
    }

    #[tokio::test]
    async fn test_unknown_payment_is_retried() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let outcome = consumer(&store, &transport, PaymentStatus::Success)
            .process(&body(Uuid::new_v4()))
            .await;
        assert!(matches!(outcome, MessageOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_failed_commit_is_retried_and_leaves_pending() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;
        store.fail_next_commits(1);

        let consumer = consumer(&store, &transport, PaymentStatus::Success);
        assert!(matches!(
            consumer.process(&body(id)).await,
            MessageOutcome::Retry(_)
        ));
        assert_eq!(
            store.get_payment(id).await.unwrap().status,
            PaymentStatus::Pending
        );

        assert_eq!(
            consumer.process(&body(id)).await,
            MessageOutcome::Applied(PaymentStatus::Success)
        );
    }

    #[tokio::test]
    async fn test_begin_failure_is_retried() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;
        store.fail_next_begins(1);

        let outcome = consumer(&store, &transport, PaymentStatus::Success)
            .process(&body(id))
            .await;
        assert!(matches!(outcome, MessageOutcome::Retry(_)));
    }

    #[tokio::test]
    async fn test_run_settles_each_outcome() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;

        transport.inject(body(id)).unwrap();
        transport.inject(body(id)).unwrap();
        transport.inject(b"garbage".to_vec()).unwrap();

        let consumer = consumer(&store, &transport, PaymentStatus::Success);
        let cancel = CancellationToken::new();
        let handle = {
            let consumer = consumer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { consumer.run(cancel).await })
        };

        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            transport.wait_for_settlements(3),
        )
        .await
        .unwrap();
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let kinds: Vec<Settlement> = transport.settlements().into_iter().map(|(_, s)| s).collect();
        assert_eq!(kinds, vec![Settlement::Ack, Settlement::Ack, Settlement::Drop]);
    }

    struct FailingStream;

    #[async_trait::async_trait]
    impl MessageTransport for FailingStream {
        async fn publish(&self, _payment_id: Uuid) -> Result<(), TransportError> {
            Ok(())
        }

        async fn consume(&self) -> Result<cashflow_core::DeliveryStream, TransportError> {
            Ok(
                futures::stream::repeat_with(|| -> Result<Box<dyn Delivery>, TransportError> {
                    Err(TransportError::Consume("channel closed by broker".to_string()))
                })
                .boxed(),
            )
        }

        async fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_closed_stream_ends_run_with_error() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let id = pending_payment(&store).await;
        transport.inject(body(id)).unwrap();

        let consumer = consumer(&store, &transport, PaymentStatus::Success);
        let handle = tokio::spawn(async move { consumer.run(CancellationToken::new()).await });
        tokio::time::timeout(
            std::time::Duration::from_secs(2),
            transport.wait_for_settlements(1),
        )
        .await
        .unwrap();
        transport.close().await.unwrap();

        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_repeated_stream_errors_end_run() {
        let store = InMemoryPaymentStore::new();
        let consumer = PaymentStatusConsumer::new(
            Arc::new(store),
            Arc::new(FailingStream),
            Arc::new(FixedOutcome(PaymentStatus::Success)),
            ConsumerConfig::default(),
        );

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            consumer.run(CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(TransportError::Consume(_))));
    }

    fn logged_with(lines: &[&str], message: &str, payment_id: Uuid) -> Result<(), String> {
        let id = payment_id.to_string();
        if lines.iter().any(|line| line.contains(message) && line.contains(&id)) {
            Ok(())
        } else {
            Err(format!("no {message:?} line mentions payment {id}"))
        }
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_settlement_logs_carry_payment_id() {
        let store = InMemoryPaymentStore::new();
        let transport = InMemoryTransport::new();
        let applied = pending_payment(&store).await;
        let retried = pending_payment(&store).await;
        transport.inject(body(applied)).unwrap();
        transport.inject(body(retried)).unwrap();

        let consumer = consumer(&store, &transport, PaymentStatus::Success);
        let mut deliveries = transport.consume().await.unwrap();

        let first = deliveries.next().await.unwrap().unwrap();
        consumer.handle(first).await;

        store.fail_next_begins(1);
        let second = deliveries.next().await.unwrap().unwrap();
        assert!(matches!(
            consumer.handle(second).await,
            MessageOutcome::Retry(_)
        ));

        logs_assert(|lines: &[&str]| logged_with(lines, "Payment status applied", applied));
        logs_assert(|lines: &[&str]| logged_with(lines, "Requeueing status update", retried));
    }
}
