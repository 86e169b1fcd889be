// Cashflow API server

use std::sync::Arc;

use anyhow::{Context, Result};
use cashflow_api::{ApiConfig, AppState};
use cashflow_storage::PostgresPaymentStore;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cashflow_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ApiConfig::from_env().context("Invalid API configuration")?;

    let pool = cashflow_storage::connect(&config.database_url, config.database_max_connections)
        .await
        .context("Failed to connect to database")?;
    cashflow_storage::migrate(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    let state = AppState::new(Arc::new(PostgresPaymentStore::new(pool)));
    let app = cashflow_api::app(state);

    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown signal received");
        })
        .await
        .context("Server error")?;

    Ok(())
}
