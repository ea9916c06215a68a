use rocket::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tradesync_gateway::RetryPolicy;

pub mod account;
pub mod api;
pub mod cli;
pub mod credentials;
pub mod env;
pub mod error;
pub mod ledger;
mod lock;
pub mod merger;
pub mod reconcile;
pub mod sync;
pub mod telemetry;

#[cfg(test)]
pub mod test_utils;

pub use env::{Env, LogLevel, setup_tracing};
pub use sync::{AccountSync, SyncConfig, SyncOrchestrator, SyncOutcome};

use crate::api::SyncState;

/// How long in-flight requests get to wind down after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(45);

pub async fn launch(env: Env) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;

    // Run database migrations to ensure all tables exist
    sqlx::migrate!().run(&pool).await?;

    let gateway = Arc::new(env.gateway.build_gateway(RetryPolicy::default())?);
    let orchestrator = SyncOrchestrator::new(
        gateway,
        pool.clone(),
        env.cipher()?,
        env.sync.sync_config(),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let config = Config::figment()
        .merge(("port", env.server_port))
        .merge(("address", "0.0.0.0"));

    let rocket = rocket::custom(config)
        .mount("/", api::routes())
        .manage(pool.clone())
        .manage(SyncState {
            syncer: Arc::new(orchestrator),
            shutdown: shutdown_rx,
        });

    let mut server_task = tokio::spawn(rocket.launch());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, cancelling running syncs...");
        }

        result = &mut server_task => {
            match result {
                Ok(Ok(_)) => info!("Server completed successfully"),
                Ok(Err(e)) => error!("Server failed: {e}"),
                Err(e) => error!("Server task panicked: {e}"),
            }
        }
    }

    shutdown_tx.send_replace(true);

    if !server_task.is_finished()
        && tokio::time::timeout(SHUTDOWN_GRACE, server_task)
            .await
            .is_err()
    {
        warn!("Server did not stop within {SHUTDOWN_GRACE:?}");
    }

    info!("Shutdown complete");
    Ok(())
}
