use clap::{Parser, Subcommand};
use sqlx::SqlitePool;
use std::io::Write;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info};
use tradesync_gateway::{GatewayApi, Platform, RetryPolicy};

use crate::account::NewAccountLink;
use crate::env::Env;
use crate::lock::with_sync_lease;
use crate::sync::{SyncOrchestrator, SyncOutcome};

#[derive(Debug, Error)]
pub enum CliError {
    #[error("Login must not be empty")]
    EmptyLogin,
    #[error("Server name must not be empty")]
    EmptyServer,
    #[error("Sync failed: {message}")]
    SyncFailed { message: String },
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Store a broker account so it can be synced
    Link {
        /// Local user owning the link
        #[arg(long)]
        owner: String,
        /// Broker account number
        #[arg(long)]
        login: String,
        /// Broker server name, e.g. ICMarketsSC-Demo
        #[arg(long)]
        server: String,
        /// mt4 or mt5
        #[arg(long)]
        platform: Platform,
        /// Broker password; stored encrypted
        #[arg(long, env = "LINK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// Import new trades of a linked account
    Sync {
        #[arg(long = "account-id")]
        account_id: i64,
        #[arg(long)]
        owner: String,
    },
}

#[derive(Debug, Parser)]
#[command(name = "tradesync-cli")]
#[command(about = "Link broker accounts and import their trade history")]
#[command(version)]
pub struct CliEnv {
    #[clap(flatten)]
    pub env: Env,
    #[command(subcommand)]
    pub command: Commands,
}

impl CliEnv {
    /// Parse CLI arguments and split off the shared Env
    pub fn parse_and_convert() -> anyhow::Result<(Env, Commands)> {
        let cli_env = Self::try_parse()?;
        Ok((cli_env.env, cli_env.command))
    }
}

pub async fn run_command(env: Env, command: Commands) -> anyhow::Result<()> {
    let pool = env.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let gateway = Arc::new(env.gateway.build_gateway(RetryPolicy::default())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C, cancelling");
            let _ = shutdown_tx.send(true);
        }
    });

    run_command_with_writers(
        &env,
        &pool,
        gateway,
        command,
        shutdown_rx,
        &mut std::io::stdout(),
    )
    .await
}

async fn run_command_with_writers<G: GatewayApi, W: Write>(
    env: &Env,
    pool: &SqlitePool,
    gateway: Arc<G>,
    command: Commands,
    shutdown: watch::Receiver<bool>,
    stdout: &mut W,
) -> anyhow::Result<()> {
    match command {
        Commands::Link {
            owner,
            login,
            server,
            platform,
            password,
        } => {
            let login = login.trim().to_string();
            let server = server.trim().to_string();
            if login.is_empty() {
                return Err(CliError::EmptyLogin.into());
            }
            if server.is_empty() {
                return Err(CliError::EmptyServer.into());
            }

            let encrypted_password = env.cipher()?.encrypt(&password)?;
            let link = NewAccountLink {
                owner,
                login,
                server,
                platform,
                encrypted_password,
            };
            let account_id = link.insert(pool).await?;

            info!(account_id, login = %link.login, "Linked broker account");
            writeln!(
                stdout,
                "Linked {} on {} ({}) as account {account_id}",
                link.login,
                link.server,
                link.platform.as_str()
            )?;
        }
        Commands::Sync { account_id, owner } => {
            let orchestrator = SyncOrchestrator::new(
                gateway,
                pool.clone(),
                env.cipher()?,
                env.sync.sync_config(),
            );

            let outcome = with_sync_lease(
                pool,
                account_id,
                orchestrator.sync(account_id, &owner, shutdown),
            )
            .await?;

            writeln!(stdout, "{}", serde_json::to_string_pretty(&outcome)?)?;

            if let SyncOutcome::Failure { message, .. } = outcome {
                error!(account_id, "Sync failed: {message}");
                return Err(CliError::SyncFailed { message }.into());
            }
        }
    }

    Ok(())
}
