// Payment domain types
// Decision: status is a closed enum; PENDING is the only non-terminal state

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Maximum number of fractional digits an amount may carry (NUMERIC(18,2)).
pub const MAX_AMOUNT_SCALE: u32 = 2;

/// Currencies accepted by the payment API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentCurrency {
    Etb,
    Usd,
}

impl PaymentCurrency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Etb => "ETB",
            Self::Usd => "USD",
        }
    }
}

impl std::fmt::Display for PaymentCurrency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentCurrency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ETB" => Ok(Self::Etb),
            "USD" => Ok(Self::Usd),
            other => Err(format!("invalid currency: {other}")),
        }
    }
}

/// Lifecycle of a payment
///
/// `Pending` moves to exactly one of `Success` or `Failed`; both are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum PaymentStatus {
    Pending,
    Success,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        }
    }

    /// Whether the status can no longer change
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("invalid payment status: {other}")),
        }
    }
}

/// A persisted payment
///
/// This is also the snapshot serialized into the outbox payload, so the
/// JSON field names are part of the relay contract (`id` in particular).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Payment {
    pub id: Uuid,
    pub reference: Uuid,
    #[schema(value_type = String, example = "100000.00")]
    pub amount: Decimal,
    pub currency: PaymentCurrency,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Payment fields supplied by the caller; the store assigns id and timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct NewPayment {
    pub reference: Uuid,
    pub amount: Decimal,
    pub currency: PaymentCurrency,
    pub status: PaymentStatus,
}

/// Request body for creating a payment
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatePaymentRequest {
    #[schema(value_type = String, example = "100000")]
    pub amount: Decimal,
    pub currency: PaymentCurrency,
    pub reference: Uuid,
}

impl CreatePaymentRequest {
    /// Check the business rules that deserialization cannot express
    pub fn validate(&self) -> Result<(), String> {
        if self.amount <= Decimal::ZERO {
            return Err("amount must be greater than zero".to_string());
        }
        if self.amount.scale() > MAX_AMOUNT_SCALE {
            return Err(format!(
                "amount cannot have more than {MAX_AMOUNT_SCALE} decimal places"
            ));
        }
        if self.reference.is_nil() {
            return Err("reference is required".to_string());
        }
        Ok(())
    }

    pub fn into_new_payment(self) -> NewPayment {
        NewPayment {
            reference: self.reference,
            amount: self.amount,
            currency: self.currency,
            status: PaymentStatus::Pending,
        }
    }
}

/// Response body for a created payment
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CreatePaymentResponse {
    pub id: Uuid,
    pub status: PaymentStatus,
}

impl From<&Payment> for CreatePaymentResponse {
    fn from(payment: &Payment) -> Self {
        Self {
            id: payment.id,
            status: payment.status,
        }
    }
}

/// Response body for payment lookups
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentDetailsResponse {
    pub id: Uuid,
    #[schema(value_type = String, example = "100000.00")]
    pub amount: Decimal,
    pub currency: PaymentCurrency,
    pub reference: Uuid,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

impl From<Payment> for PaymentDetailsResponse {
    fn from(payment: Payment) -> Self {
        Self {
            id: payment.id,
            amount: payment.amount,
            currency: payment.currency,
            reference: payment.reference,
            status: payment.status,
            created_at: payment.created_at,
        }
    }
}
