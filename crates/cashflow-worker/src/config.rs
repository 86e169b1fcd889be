// Worker configuration
// Decision: only the binary reads the environment; components receive these structs

use std::time::Duration;

use cashflow_core::config::{parse, required};
pub use cashflow_core::ConfigError;

use crate::consumer::ConsumerConfig;
use crate::pool::TaskPoolConfig;
use crate::rabbitmq::RabbitMqConfig;
use crate::relay::RelayConfig;

/// Everything the worker process needs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    pub rabbitmq: RabbitMqConfig,
    pub relay: RelayConfig,
    pub pool: TaskPoolConfig,
    pub consumer: ConsumerConfig,
}

impl WorkerConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = required(&lookup, "DATABASE_URL")?;
        let database_max_connections =
            parse::<u32, _>(&lookup, "DATABASE_MAX_CONNECTIONS")?.unwrap_or(10);

        let rabbitmq_url = required(&lookup, "RABBITMQ_URL")?;
        let mut rabbitmq = RabbitMqConfig::new(rabbitmq_url);
        if let Some(queue) = lookup("PAYMENT_QUEUE").filter(|q| !q.is_empty()) {
            rabbitmq.queue = queue;
        }

        let mut relay = RelayConfig::default();
        if let Some(secs) = parse::<u64, _>(&lookup, "OUTBOX_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Invalid {
                    key: "OUTBOX_INTERVAL_SECS",
                    value: secs.to_string(),
                    reason: "interval must be at least one second".to_string(),
                });
            }
            relay = relay.with_interval(Duration::from_secs(secs));
        }
        if let Some(batch) = parse::<i64, _>(&lookup, "OUTBOX_BATCH_SIZE")? {
            if batch > 0 {
                relay = relay.with_batch_size(batch as usize);
            }
        }

        // Non-positive sizes fall back to the pool defaults
        let workers = parse::<i64, _>(&lookup, "WORKER_POOL_SIZE")?.unwrap_or(0);
        let queue_capacity = parse::<i64, _>(&lookup, "WORKER_QUEUE_CAPACITY")?.unwrap_or(0);
        let pool = TaskPoolConfig::new(
            usize::try_from(workers).unwrap_or(0),
            usize::try_from(queue_capacity).unwrap_or(0),
        );

        let mut consumer = ConsumerConfig::default();
        if let Some(max) = parse::<usize, _>(&lookup, "CONSUMER_MAX_IN_FLIGHT")? {
            consumer = consumer.with_max_in_flight(max);
        }
        rabbitmq.prefetch = u16::try_from(consumer.max_in_flight).unwrap_or(u16::MAX);

        Ok(Self {
            database_url,
            database_max_connections,
            rabbitmq,
            relay,
            pool,
            consumer,
        })
    }
}
