// Business decision for a pending payment

use rand::Rng;

use cashflow_core::{Payment, PaymentStatus};

/// Chooses the terminal status for a pending payment
pub trait OutcomeDecider: Send + Sync {
    fn decide(&self, payment: &Payment) -> PaymentStatus;
}

/// Uniformly random SUCCESS or FAILED
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomOutcome;

impl OutcomeDecider for RandomOutcome {
    fn decide(&self, _payment: &Payment) -> PaymentStatus {
        if rand::thread_rng().gen_bool(0.5) {
            PaymentStatus::Success
        } else {
            PaymentStatus::Failed
        }
    }
}

/// Always the same status
#[derive(Debug, Clone, Copy)]
pub struct FixedOutcome(pub PaymentStatus);

impl OutcomeDecider for FixedOutcome {
    fn decide(&self, _payment: &Payment) -> PaymentStatus {
        self.0
    }
}
