//! Error types for the local side of a sync, and the fixed user-facing
//! vocabulary they collapse into.

use serde::Serialize;
use std::time::Duration;
use tradesync_gateway::models::InvalidPlatformError;
use tradesync_gateway::{GatewayError, LifecycleError, ProvisionError};

use crate::credentials::CredentialError;

/// Database persistence and data corruption errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Invalid link status in database: {0}")]
    InvalidLinkStatus(String),
    #[error("Invalid platform in database: {0}")]
    InvalidPlatform(#[from] InvalidPlatformError),
    #[error("Invalid trade direction in database: {0}")]
    InvalidDirection(String),
    #[error("Account link {account_id} not found")]
    AccountNotFound { account_id: i64 },
}

/// Why a sync failed. Carries the diagnostic detail for logs; callers only
/// ever see [`SyncErrorKind`] and its message.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Account link {account_id} not found for this owner")]
    AccountNotFound { account_id: i64 },
    #[error("Failed to read stored credentials: {0}")]
    Credentials(#[from] CredentialError),
    #[error("Failed to provision remote proxy: {0}")]
    Provision(#[from] ProvisionError),
    #[error("Failed to deploy remote proxy: {0}")]
    Deploy(GatewayError),
    #[error("Remote proxy did not connect within {waited:?}")]
    ConnectTimeout { waited: Duration },
    #[error("Remote proxy has no region assigned")]
    MissingRegion,
    #[error("Failed to fetch deals: {0}")]
    DealFetch(GatewayError),
    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("Sync cancelled")]
    Cancelled,
    #[error("Sync exceeded its {budget:?} budget")]
    BudgetExceeded { budget: Duration },
}

impl From<LifecycleError> for SyncError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::ConnectTimeout { waited } => Self::ConnectTimeout { waited },
            LifecycleError::Gateway(e) => Self::Deploy(e),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncErrorKind {
    AccountNotFound,
    CredentialDecryptionFailed,
    ProvisionFailed,
    DeployFailed,
    ConnectTimeout,
    InfoFetchFailed,
    DealFetchFailed,
    PartialMergeFailure,
    Persistence,
    Cancelled,
    BudgetExceeded,
}

impl SyncErrorKind {
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::AccountNotFound => "Trading account not found.",
            Self::CredentialDecryptionFailed => {
                "Stored broker credentials could not be read. Please link the account again."
            }
            Self::ProvisionFailed => {
                "Could not set up a connection to your broker. Check the login and server."
            }
            Self::DeployFailed => "Could not start the broker connection. Please try again later.",
            Self::ConnectTimeout => {
                "Your broker did not respond in time. Please try again in a few minutes."
            }
            Self::InfoFetchFailed => "Account balance could not be refreshed.",
            Self::DealFetchFailed => "Could not download trade history. Please try again later.",
            Self::PartialMergeFailure => {
                "Some trades could not be saved and will be picked up by the next sync."
            }
            Self::Persistence => "Could not save sync results. Please try again later.",
            Self::Cancelled => "Sync was cancelled before it finished.",
            Self::BudgetExceeded => "Sync took too long and was stopped. Please try again later.",
        }
    }
}

impl SyncError {
    pub const fn kind(&self) -> SyncErrorKind {
        match self {
            Self::AccountNotFound { .. } => SyncErrorKind::AccountNotFound,
            Self::Credentials(_) => SyncErrorKind::CredentialDecryptionFailed,
            Self::Provision(_) => SyncErrorKind::ProvisionFailed,
            Self::Deploy(_) | Self::MissingRegion => SyncErrorKind::DeployFailed,
            Self::ConnectTimeout { .. } => SyncErrorKind::ConnectTimeout,
            Self::DealFetch(_) => SyncErrorKind::DealFetchFailed,
            Self::Persistence(_) => SyncErrorKind::Persistence,
            Self::Cancelled => SyncErrorKind::Cancelled,
            Self::BudgetExceeded { .. } => SyncErrorKind::BudgetExceeded,
        }
    }
}
