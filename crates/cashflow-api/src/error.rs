// HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use cashflow_core::PaymentError;
use serde::Serialize;
use utoipa::ToSchema;

/// Error body returned by every failing endpoint
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    #[schema(example = "amount must be greater than zero")]
    pub error: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<PaymentError> for ApiError {
    fn from(err: PaymentError) -> Self {
        match err {
            PaymentError::InvalidInput(msg) => Self::BadRequest(msg),
            PaymentError::ResourceNotFound(_) => Self::NotFound(err.to_string()),
            // Storage details stay in the logs
            PaymentError::UnableToCreate(_) => Self::Internal("unable to create payment".to_string()),
            PaymentError::UnableToGet(_) => Self::Internal("unable to get payment".to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorResponse {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashflow_core::StoreError;
    use uuid::Uuid;

    #[test]
    fn test_payment_error_status_codes() {
        let cases = [
            (PaymentError::InvalidInput("bad".into()), StatusCode::BAD_REQUEST),
            (PaymentError::ResourceNotFound(Uuid::new_v4()), StatusCode::NOT_FOUND),
            (
                PaymentError::UnableToCreate(StoreError::ConnectionFailure("down".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                PaymentError::UnableToGet(StoreError::Internal("boom".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[test]
    fn test_internal_error_hides_store_details() {
        let err = ApiError::from(PaymentError::UnableToCreate(StoreError::ConnectionFailure(
            "password authentication failed".into(),
        )));
        assert!(!err.to_string().contains("password"));
    }
}
