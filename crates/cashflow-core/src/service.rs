// Payment creation and lookup
//
// The creation path never publishes to the broker. It only writes the
// payment and its outbox event; the relay takes it from there.

use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::PaymentError;
use crate::payment::{CreatePaymentRequest, Payment};
use crate::store::PaymentStore;

pub struct PaymentService<S: PaymentStore> {
    store: Arc<S>,
}

impl<S: PaymentStore> Clone for PaymentService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: PaymentStore> PaymentService<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Validate and persist a new PENDING payment together with its outbox event
    #[instrument(skip(self, request), fields(reference = %request.reference))]
    pub async fn create_payment(&self, request: CreatePaymentRequest) -> Result<Payment, PaymentError> {
        request.validate().map_err(PaymentError::InvalidInput)?;

        let payment = self
            .store
            .create_payment_with_outbox(request.into_new_payment())
            .await
            .map_err(|e| {
                warn!(error = %e, "Failed to create payment");
                PaymentError::UnableToCreate(e)
            })?;

        info!(payment_id = %payment.id, amount = %payment.amount, currency = %payment.currency, "Payment created");
        Ok(payment)
    }

    #[instrument(skip(self))]
    pub async fn get_payment(&self, id: Uuid) -> Result<Payment, PaymentError> {
        self.store.get_payment(id).await.map_err(|e| {
            if e.is_not_found() {
                PaymentError::ResourceNotFound(id)
            } else {
                warn!(error = %e, "Failed to get payment");
                PaymentError::UnableToGet(e)
            }
        })
    }
}
