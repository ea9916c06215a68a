use clap::{Args, Parser};
use sqlx::SqlitePool;
use std::fmt;
use std::time::Duration;
use tracing::Level;
use tradesync_gateway::{DealFetchConfig, GatewayEnv, LifecycleConfig, ProvisionConfig};

use crate::credentials::{CredentialCipher, CredentialError};
use crate::sync::SyncConfig;
use crate::telemetry::{TelemetryGuard, default_filter, setup_telemetry};

#[derive(clap::ValueEnum, Debug, Clone)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(log_level: LogLevel) -> Self {
        (&log_level).into()
    }
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Timing knobs of the sync saga.
#[derive(Args, Debug, Clone)]
pub struct SyncEnv {
    /// Creation polls before provisioning gives up
    #[clap(long, env, default_value = "15", value_parser = clap::value_parser!(u32).range(1..=1_000))]
    pub provision_max_polls: u32,
    /// Wait between creation polls when the gateway suggests none
    #[clap(long, env, default_value = "5", value_parser = clap::value_parser!(u64).range(1..=3_600))]
    pub provision_poll_wait_secs: u64,
    #[clap(long, env, default_value = "30", value_parser = clap::value_parser!(u64).range(1..=3_600))]
    pub provision_max_poll_wait_secs: u64,
    #[clap(long, env, default_value = "5", value_parser = clap::value_parser!(u64).range(1..=300))]
    pub connect_poll_interval_secs: u64,
    #[clap(long, env, default_value = "150", value_parser = clap::value_parser!(u64).range(1..=3_600))]
    pub connect_timeout_secs: u64,
    /// Pause before re-asking for history on a never-synced account
    #[clap(long, env, default_value = "15", value_parser = clap::value_parser!(u64).range(0..=3_600))]
    pub empty_history_retry_secs: u64,
    #[clap(
        long,
        env,
        default_value = "1000",
        value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..=10_000)
    )]
    pub deal_page_size: usize,
    #[clap(long, env, default_value = "730", value_parser = clap::value_parser!(i64).range(1..=36_500))]
    pub lookback_days: i64,
}

impl SyncEnv {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            provision: ProvisionConfig {
                max_polls: self.provision_max_polls,
                default_poll_wait: Duration::from_secs(self.provision_poll_wait_secs),
                max_poll_wait: Duration::from_secs(self.provision_max_poll_wait_secs),
            },
            lifecycle: LifecycleConfig {
                poll_interval: Duration::from_secs(self.connect_poll_interval_secs),
                connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            },
            deals: DealFetchConfig {
                page_size: self.deal_page_size,
                empty_history_retry_delay: Duration::from_secs(self.empty_history_retry_secs),
                ..DealFetchConfig::default()
            },
            lookback_days: self.lookback_days,
            ..SyncConfig::default()
        }
    }
}

#[derive(Parser, Clone)]
pub struct Env {
    #[clap(long = "db", env)]
    pub database_url: String,
    #[clap(long, env, default_value = "debug")]
    pub log_level: LogLevel,
    /// Base64 of the 32-byte key sealing stored broker passwords
    #[clap(long, env)]
    pub credentials_key: String,
    #[clap(long, env, default_value = "8080")]
    pub server_port: u16,
    #[clap(flatten)]
    pub gateway: GatewayEnv,
    #[clap(flatten)]
    pub sync: SyncEnv,
    /// HyperDX API key for telemetry export (optional)
    #[clap(long, env)]
    pub hyperdx_api_key: Option<String>,
}

impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("database_url", &self.database_url)
            .field("log_level", &self.log_level)
            .field("server_port", &self.server_port)
            .field("gateway", &self.gateway)
            .field("sync", &self.sync)
            .field("hyperdx_api_key", &self.hyperdx_api_key.as_ref().map(|_| "<set>"))
            .finish_non_exhaustive()
    }
}

impl Env {
    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        SqlitePool::connect(&self.database_url).await
    }

    pub fn cipher(&self) -> Result<CredentialCipher, CredentialError> {
        CredentialCipher::from_base64_key(&self.credentials_key)
    }
}

/// Installs the global subscriber. With a HyperDX key spans are exported as
/// well; the returned guard flushes them on drop.
pub fn setup_tracing(log_level: &LogLevel, hyperdx_api_key: Option<&str>) -> Option<TelemetryGuard> {
    let level: Level = log_level.into();

    if let Some(api_key) = hyperdx_api_key {
        match setup_telemetry(api_key.to_string(), level) {
            Ok(guard) => return Some(guard),
            Err(e) => eprintln!("Failed to set up telemetry: {e}, falling back to console logging"),
        }
    }

    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter(level).into()),
        )
        .compact()
        .try_init()
    {
        eprintln!("Failed to initialize console logging: {e}");
    }

    None
}
