//! Cashflow background worker
//!
//! - [`OutboxRelay`] drains the outbox table into the message transport
//! - [`PaymentStatusConsumer`] applies status updates received from it
//! - [`TaskPool`] bounds how many status updates run at once

pub mod config;
pub mod consumer;
pub mod decider;
pub mod pool;
pub mod rabbitmq;
pub mod relay;
pub mod supervisor;

pub use config::{ConfigError, WorkerConfig};
pub use consumer::{
    ConsumerConfig, MessageOutcome, PaymentStatusConsumer, MAX_CONSECUTIVE_STREAM_ERRORS,
};
pub use decider::{FixedOutcome, OutcomeDecider, RandomOutcome};
pub use pool::{PoolError, PoolStats, TaskPool, TaskPoolConfig};
pub use rabbitmq::{RabbitMqConfig, RabbitMqTransport};
pub use relay::{CycleReport, OutboxRelay, RelayConfig, RelayError};
pub use supervisor::{run_until, WorkerError};
