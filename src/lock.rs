use sqlx::SqlitePool;
use std::future::Future;
use thiserror::Error;
use tracing::{error, warn};

use crate::error::PersistenceError;

#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("A sync of account {account_id} is already running")]
    Busy { account_id: i64 },
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Leases older than this are assumed to belong to a crashed process.
const LEASE_TIMEOUT_MINUTES: i32 = 30;

/// Atomically takes the sync lease for an account.
/// Returns false if another sync holds it.
pub(crate) async fn try_acquire_sync_lease(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<bool, PersistenceError> {
    let mut sql_tx = pool.begin().await?;

    let timeout_param = format!("-{LEASE_TIMEOUT_MINUTES} minutes");
    sqlx::query("DELETE FROM sync_leases WHERE locked_at < datetime('now', ?1)")
        .bind(timeout_param)
        .execute(sql_tx.as_mut())
        .await?;

    let result = sqlx::query("INSERT OR IGNORE INTO sync_leases (account_id) VALUES (?1)")
        .bind(account_id)
        .execute(sql_tx.as_mut())
        .await?;

    sql_tx.commit().await?;

    Ok(result.rows_affected() > 0)
}

pub(crate) async fn release_sync_lease(
    pool: &SqlitePool,
    account_id: i64,
) -> Result<(), PersistenceError> {
    sqlx::query("DELETE FROM sync_leases WHERE account_id = ?1")
        .bind(account_id)
        .execute(pool)
        .await?;

    Ok(())
}

/// Held for the duration of one sync. If the work never completes (it
/// panicked or its future was dropped) the release is spawned from `drop`.
struct LeaseGuard {
    pool: SqlitePool,
    account_id: i64,
    released: bool,
}

impl LeaseGuard {
    async fn release(mut self) {
        self.released = true;

        if let Err(e) = release_sync_lease(&self.pool, self.account_id).await {
            error!(account_id = self.account_id, "Failed to release sync lease: {e}");
        }
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let pool = self.pool.clone();
        let account_id = self.account_id;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(account_id, "Sync ended abnormally, releasing its lease");
                handle.spawn(async move {
                    if let Err(e) = release_sync_lease(&pool, account_id).await {
                        error!(account_id, "Failed to release sync lease: {e}");
                    }
                });
            }
            Err(_) => warn!(
                account_id,
                "No runtime to release sync lease, it expires after {LEASE_TIMEOUT_MINUTES} minutes"
            ),
        }
    }
}

/// Runs `work` while holding the account's sync lease.
pub async fn with_sync_lease<F>(
    pool: &SqlitePool,
    account_id: i64,
    work: F,
) -> Result<F::Output, LeaseError>
where
    F: Future + Send,
{
    if !try_acquire_sync_lease(pool, account_id).await? {
        return Err(LeaseError::Busy { account_id });
    }

    let guard = LeaseGuard {
        pool: pool.clone(),
        account_id,
        released: false,
    };

    let output = work.await;
    guard.release().await;

    Ok(output)
}
