use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use std::fmt::{self, Display};
use std::str::FromStr;
use tracing::{debug, warn};
use tradesync_gateway::{AccountCredentials, AccountInformation, Platform, ProxyId, Region};

use crate::credentials::{CredentialCipher, CredentialError};
use crate::error::PersistenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Syncing,
    Active,
    Error,
}

impl LinkStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Syncing => "SYNCING",
            Self::Active => "ACTIVE",
            Self::Error => "ERROR",
        }
    }
}

impl Display for LinkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LinkStatus {
    type Err = PersistenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "SYNCING" => Ok(Self::Syncing),
            "ACTIVE" => Ok(Self::Active),
            "ERROR" => Ok(Self::Error),
            _ => Err(PersistenceError::InvalidLinkStatus(s.to_string())),
        }
    }
}

/// A user's broker login as stored locally, with the state of its sync.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountLink {
    pub id: i64,
    pub owner: String,
    pub login: String,
    pub server: String,
    pub platform: Platform,
    pub encrypted_password: String,
    pub remote_proxy_id: Option<ProxyId>,
    pub region: Option<Region>,
    pub status: LinkStatus,
    pub last_sync_checkpoint: Option<DateTime<Utc>>,
    /// Balance snapshot from the last successful account-information read.
    pub snapshot: Option<AccountInformation>,
    pub last_error: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct NewAccountLink {
    pub owner: String,
    pub login: String,
    pub server: String,
    pub platform: Platform,
    pub encrypted_password: String,
}

impl fmt::Debug for NewAccountLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccountLink")
            .field("owner", &self.owner)
            .field("login", &self.login)
            .field("server", &self.server)
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl NewAccountLink {
    pub async fn insert(&self, pool: &SqlitePool) -> Result<i64, PersistenceError> {
        let result = sqlx::query(
            r"
            INSERT INTO account_links (owner, login, server, platform, encrypted_password)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
        )
        .bind(&self.owner)
        .bind(&self.login)
        .bind(&self.server)
        .bind(self.platform.as_str())
        .bind(&self.encrypted_password)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }
}

const SELECT_LINK: &str = r"
    SELECT id, owner, login, server, platform, encrypted_password, remote_proxy_id,
           region, status, last_sync_checkpoint, balance, equity, currency, leverage,
           last_error, last_synced_at, created_at
    FROM account_links
";

fn link_from_row(row: &SqliteRow) -> Result<AccountLink, PersistenceError> {
    let platform: String = row.try_get("platform")?;
    let status: String = row.try_get("status")?;

    let balance: Option<f64> = row.try_get("balance")?;
    let equity: Option<f64> = row.try_get("equity")?;
    let currency: Option<String> = row.try_get("currency")?;
    let snapshot = match (balance, equity, currency) {
        (Some(balance), Some(equity), Some(currency)) => Some(AccountInformation {
            balance,
            equity,
            currency,
            leverage: row.try_get("leverage")?,
        }),
        _ => None,
    };

    Ok(AccountLink {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        login: row.try_get("login")?,
        server: row.try_get("server")?,
        platform: platform.parse()?,
        encrypted_password: row.try_get("encrypted_password")?,
        remote_proxy_id: row.try_get::<Option<String>, _>("remote_proxy_id")?.map(ProxyId),
        region: row.try_get::<Option<String>, _>("region")?.map(Region),
        status: status.parse()?,
        last_sync_checkpoint: row.try_get("last_sync_checkpoint")?,
        snapshot,
        last_error: row.try_get("last_error")?,
        last_synced_at: row.try_get("last_synced_at")?,
        created_at: row.try_get("created_at")?,
    })
}

impl AccountLink {
    /// Looks the link up by id, scoped to its owner.
    pub async fn find(
        pool: &SqlitePool,
        id: i64,
        owner: &str,
    ) -> Result<Option<Self>, PersistenceError> {
        let row = sqlx::query(&format!("{SELECT_LINK} WHERE id = ?1 AND owner = ?2"))
            .bind(id)
            .bind(owner)
            .fetch_optional(pool)
            .await?;

        row.as_ref().map(link_from_row).transpose()
    }

    pub fn credentials(
        &self,
        cipher: &CredentialCipher,
    ) -> Result<AccountCredentials, CredentialError> {
        Ok(AccountCredentials {
            login: self.login.clone(),
            password: cipher.decrypt(&self.encrypted_password)?,
            server: self.server.clone(),
            platform: self.platform,
        })
    }

    pub async fn set_remote_proxy(
        pool: &SqlitePool,
        id: i64,
        proxy_id: &ProxyId,
        region: Option<&Region>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            UPDATE account_links
            SET remote_proxy_id = ?1, region = COALESCE(?2, region)
            WHERE id = ?3
            ",
        )
        .bind(&proxy_id.0)
        .bind(region.map(|r| r.0.as_str()))
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn set_status(
        pool: &SqlitePool,
        id: i64,
        status: LinkStatus,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE account_links SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }

    pub async fn update_snapshot(
        pool: &SqlitePool,
        id: i64,
        info: &AccountInformation,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            UPDATE account_links
            SET balance = ?1, equity = ?2, currency = ?3, leverage = COALESCE(?4, leverage)
            WHERE id = ?5
            ",
        )
        .bind(info.balance)
        .bind(info.equity)
        .bind(&info.currency)
        .bind(info.leverage)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Moves the checkpoint forward to `to`. Never moves it backwards;
    /// returns whether the stored value changed.
    pub async fn advance_checkpoint(
        pool: &SqlitePool,
        id: i64,
        to: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut sql_tx = pool.begin().await?;

        let current: Option<Option<DateTime<Utc>>> =
            sqlx::query_scalar("SELECT last_sync_checkpoint FROM account_links WHERE id = ?1")
                .bind(id)
                .fetch_optional(sql_tx.as_mut())
                .await?;

        let Some(current) = current else {
            return Err(PersistenceError::AccountNotFound { account_id: id });
        };

        if current.is_some_and(|current| current >= to) {
            warn!(account_id = id, ?current, attempted = %to, "Refusing to move checkpoint backwards");
            sql_tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE account_links SET last_sync_checkpoint = ?1 WHERE id = ?2")
            .bind(to)
            .bind(id)
            .execute(sql_tx.as_mut())
            .await?;
        sql_tx.commit().await?;

        debug!(account_id = id, checkpoint = %to, "Checkpoint advanced");
        Ok(true)
    }

    pub async fn record_success(
        pool: &SqlitePool,
        id: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            r"
            UPDATE account_links
            SET status = ?1, last_synced_at = ?2, last_error = NULL
            WHERE id = ?3
            ",
        )
        .bind(LinkStatus::Active.as_str())
        .bind(synced_at)
        .bind(id)
        .execute(pool)
        .await?;

        Ok(())
    }

    pub async fn record_failure(
        pool: &SqlitePool,
        id: i64,
        message: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query("UPDATE account_links SET status = ?1, last_error = ?2 WHERE id = ?3")
            .bind(LinkStatus::Error.as_str())
            .bind(message)
            .bind(id)
            .execute(pool)
            .await?;

        Ok(())
    }
}
