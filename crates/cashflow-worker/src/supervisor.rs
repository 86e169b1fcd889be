//! Runs the relay and the consumer side by side until shutdown
//!
//! Either component exiting on its own ends the run with an error, so the
//! process never keeps relaying while nothing consumes.

use std::future::Future;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cashflow_core::{PaymentStore, TransportError};

use crate::consumer::PaymentStatusConsumer;
use crate::relay::OutboxRelay;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("status consumer stopped: {0}")]
    Consumer(#[source] TransportError),

    #[error("status consumer exited before shutdown was requested")]
    ConsumerExited,

    #[error("outbox relay exited before shutdown was requested")]
    RelayExited,

    #[error("{component} task panicked: {source}")]
    Panicked {
        component: &'static str,
        #[source]
        source: JoinError,
    },
}

/// Drive both components until `shutdown` resolves or one of them exits
///
/// On shutdown both are cancelled and awaited, so an in-flight relay cycle
/// or status update finishes first.
pub async fn run_until<S, F>(
    relay: OutboxRelay<S>,
    consumer: PaymentStatusConsumer<S>,
    shutdown: F,
) -> Result<(), WorkerError>
where
    S: PaymentStore,
    S::Tx: 'static,
    F: Future<Output = ()>,
{
    let cancel = CancellationToken::new();
    let mut relay_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { relay.run(cancel).await })
    };
    let mut consumer_handle = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    tokio::select! {
        _ = shutdown => {
            info!("Shutdown signal received");
            cancel.cancel();
            let relay = relay_handle.await;
            let consumer = consumer_handle.await;
            relay.map_err(|source| WorkerError::Panicked { component: "outbox relay", source })?;
            consumer
                .map_err(|source| WorkerError::Panicked { component: "status consumer", source })?
                .map_err(WorkerError::Consumer)
        }
        exited = &mut consumer_handle => {
            cancel.cancel();
            if let Err(e) = relay_handle.await {
                error!(error = %e, "Outbox relay task failed during shutdown");
            }
            let err = match exited {
                Ok(Ok(())) => WorkerError::ConsumerExited,
                Ok(Err(e)) => WorkerError::Consumer(e),
                Err(source) => WorkerError::Panicked { component: "status consumer", source },
            };
            error!(error = %err, "Status consumer stopped, shutting down worker");
            Err(err)
        }
        exited = &mut relay_handle => {
            cancel.cancel();
            match consumer_handle.await {
                Ok(Err(e)) => error!(error = %e, "Status consumer failed during shutdown"),
                Err(e) => error!(error = %e, "Status consumer task failed during shutdown"),
                Ok(Ok(())) => {}
            }
            let err = match exited {
                Ok(()) => WorkerError::RelayExited,
                Err(source) => WorkerError::Panicked { component: "outbox relay", source },
            };
            error!(error = %err, "Outbox relay stopped, shutting down worker");
            Err(err)
        }
    }
}
