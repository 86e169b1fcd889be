use std::sync::Arc;

use anyhow::{Context, Result};
use cashflow_core::MessageTransport;
use cashflow_storage::PostgresPaymentStore;
use cashflow_worker::{
    OutboxRelay, PaymentStatusConsumer, RabbitMqTransport, RandomOutcome, TaskPool, WorkerConfig,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cashflow_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("cashflow-worker starting...");

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;

    let pool = cashflow_storage::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    cashflow_storage::migrate(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    let transport: Arc<dyn MessageTransport> = Arc::new(
        RabbitMqTransport::connect(config.rabbitmq.clone())
            .await
            .context("Failed to connect to RabbitMQ")?,
    );

    let store = Arc::new(PostgresPaymentStore::new(pool));
    let task_pool = Arc::new(TaskPool::new(config.pool));
    task_pool.start();

    let relay = OutboxRelay::new(Arc::clone(&store), Arc::clone(&transport), config.relay);
    let consumer = PaymentStatusConsumer::new(
        store,
        Arc::clone(&transport),
        Arc::new(RandomOutcome),
        config.consumer.clone(),
    )
    .with_pool(Arc::clone(&task_pool));

    tracing::info!("Worker ready, waiting for shutdown signal...");
    let result = cashflow_worker::run_until(relay, consumer, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for shutdown signal");
        }
    })
    .await;

    // Drain status updates already handed to the pool before dropping the connection
    task_pool.stop().await;
    if let Err(e) = transport.close().await {
        tracing::warn!(error = %e, "Failed to close transport");
    }
    result.context("Worker stopped unexpectedly")?;

    tracing::info!("Worker shutdown complete");
    Ok(())
}
