//! Cashflow HTTP API
//!
//! Accepts payments and reports their status. Creating a payment only
//! writes it and its outbox event; the worker settles it asynchronously.

pub mod config;
pub mod error;
pub mod payments;

use axum::{routing::get, Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

pub use config::{ApiConfig, ConfigError};
pub use error::{ApiError, ErrorResponse};
pub use payments::{AppState, PaymentOperations};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(payments::create_payment, payments::get_payment),
    components(
        schemas(
            cashflow_core::CreatePaymentRequest,
            cashflow_core::CreatePaymentResponse,
            cashflow_core::PaymentDetailsResponse,
            cashflow_core::PaymentCurrency,
            cashflow_core::PaymentStatus,
            ErrorResponse,
        )
    ),
    tags(
        (name = "payments", description = "Payment creation and lookup")
    ),
    info(
        title = "Cashflow API",
        version = "0.1.0",
        description = "Payments API backed by a transactional outbox",
        license(name = "MIT")
    )
)]
pub struct ApiDoc;

/// Build the full application router
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api-docs/openapi.json", get(openapi))
        .merge(payments::routes(state))
        .layer(TraceLayer::new_for_http())
}
