// Payment HTTP routes

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use cashflow_core::{
    CreatePaymentRequest, CreatePaymentResponse, Payment, PaymentDetailsResponse, PaymentError,
    PaymentService, PaymentStore,
};
use uuid::Uuid;

use crate::error::{ApiError, ErrorResponse};

/// Creation path as seen by the handlers
///
/// Object-safe so the router does not carry the store type.
#[async_trait]
pub trait PaymentOperations: Send + Sync {
    async fn create_payment(&self, request: CreatePaymentRequest) -> Result<Payment, PaymentError>;

    async fn get_payment(&self, id: Uuid) -> Result<Payment, PaymentError>;
}

#[async_trait]
impl<S: PaymentStore> PaymentOperations for PaymentService<S> {
    async fn create_payment(&self, request: CreatePaymentRequest) -> Result<Payment, PaymentError> {
        PaymentService::create_payment(self, request).await
    }

    async fn get_payment(&self, id: Uuid) -> Result<Payment, PaymentError> {
        PaymentService::get_payment(self, id).await
    }
}

/// App state for payment routes
#[derive(Clone)]
pub struct AppState {
    pub payments: Arc<dyn PaymentOperations>,
}

impl AppState {
    pub fn new<S: PaymentStore>(store: Arc<S>) -> Self {
        Self {
            payments: Arc::new(PaymentService::new(store)),
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/payments", post(create_payment))
        .route("/api/v1/payments/:id", get(get_payment))
        .with_state(state)
}

/// POST /api/v1/payments - Create a pending payment
#[utoipa::path(
    post,
    path = "/api/v1/payments",
    request_body = CreatePaymentRequest,
    responses(
        (status = 201, description = "Payment accepted for processing", body = CreatePaymentResponse),
        (status = 400, description = "Malformed or invalid request", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn create_payment(
    State(state): State<AppState>,
    body: Result<Json<CreatePaymentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatePaymentResponse>), ApiError> {
    let Json(req) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let payment = state.payments.create_payment(req).await.map_err(|e| {
        if !matches!(e, PaymentError::InvalidInput(_)) {
            tracing::error!("Failed to create payment: {}", e);
        }
        ApiError::from(e)
    })?;

    Ok((StatusCode::CREATED, Json(CreatePaymentResponse::from(&payment))))
}

/// GET /api/v1/payments/{id} - Get payment
#[utoipa::path(
    get,
    path = "/api/v1/payments/{id}",
    params(
        ("id" = Uuid, Path, description = "Payment ID")
    ),
    responses(
        (status = 200, description = "Payment found", body = PaymentDetailsResponse),
        (status = 400, description = "Malformed payment ID", body = ErrorResponse),
        (status = 404, description = "Payment not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "payments"
)]
pub async fn get_payment(
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> Result<Json<PaymentDetailsResponse>, ApiError> {
    let Path(id) = id.map_err(|_| ApiError::BadRequest("invalid payment id".to_string()))?;

    let payment = state.payments.get_payment(id).await.map_err(|e| {
        if matches!(e, PaymentError::UnableToGet(_)) {
            tracing::error!("Failed to get payment {}: {}", id, e);
        }
        ApiError::from(e)
    })?;

    Ok(Json(PaymentDetailsResponse::from(payment)))
}
