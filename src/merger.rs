use itertools::Itertools;
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::error::PersistenceError;
use crate::ledger;
use crate::reconcile::ReconstructedTrade;

pub const MERGE_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MergeReport {
    /// Rows actually committed.
    pub inserted: usize,
    /// Rows stored as open that are now closed.
    pub closed: usize,
    /// Rows stored as open that are still open, rewritten with fresh figures.
    pub refreshed: usize,
    pub skipped_existing: usize,
    pub failed_batches: usize,
}

impl MergeReport {
    pub const fn is_partial(&self) -> bool {
        self.failed_batches > 0
    }

    /// Trades that became visible as new or newly closed.
    pub const fn imported(&self) -> usize {
        self.inserted + self.closed
    }
}

/// Idempotent insert of reconstructed trades into an account's ledger.
#[derive(Debug, Clone)]
pub struct TradeMerger {
    pool: SqlitePool,
    batch_size: usize,
}

impl TradeMerger {
    pub const fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            batch_size: MERGE_BATCH_SIZE,
        }
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Inserts the candidates whose ticket the ledger has not seen yet and
    /// replaces rows still stored as open. Each batch commits on its own; a
    /// failed batch is logged and skipped.
    pub async fn merge(
        &self,
        account_id: i64,
        candidates: Vec<ReconstructedTrade>,
    ) -> Result<MergeReport, PersistenceError> {
        let existing = ledger::existing_tickets(&self.pool, account_id).await?;
        let open = ledger::open_tickets(&self.pool, account_id).await?;
        let total = candidates.len();

        let (fresh, reopened): (Vec<_>, Vec<_>) = candidates
            .into_iter()
            .unique_by(|trade| trade.ticket.clone())
            .filter(|trade| !existing.contains(&trade.ticket) || open.contains(&trade.ticket))
            .partition(|trade| !existing.contains(&trade.ticket));

        let mut report = MergeReport {
            skipped_existing: total - fresh.len() - reopened.len(),
            ..MergeReport::default()
        };

        for (index, batch) in fresh.chunks(self.batch_size).enumerate() {
            match ledger::insert_batch(&self.pool, account_id, batch).await {
                Ok(inserted) => report.inserted += inserted,
                Err(e) => {
                    error!(
                        account_id,
                        batch = index,
                        size = batch.len(),
                        first_ticket = %batch[0].ticket,
                        "Failed to insert trade batch: {e}"
                    );
                    report.failed_batches += 1;
                }
            }
        }

        for (index, batch) in reopened.chunks(self.batch_size).enumerate() {
            match ledger::replace_open_batch(&self.pool, account_id, batch).await {
                Ok(_) => {
                    let closed = batch.iter().filter(|trade| !trade.is_open).count();
                    report.closed += closed;
                    report.refreshed += batch.len() - closed;
                }
                Err(e) => {
                    error!(
                        account_id,
                        batch = index,
                        size = batch.len(),
                        first_ticket = %batch[0].ticket,
                        "Failed to update open trade batch: {e}"
                    );
                    report.failed_batches += 1;
                }
            }
        }

        info!(
            account_id,
            inserted = report.inserted,
            closed = report.closed,
            refreshed = report.refreshed,
            skipped_existing = report.skipped_existing,
            failed_batches = report.failed_batches,
            "Merged trades into ledger"
        );

        Ok(report)
    }
}
