//! The account sync saga: link lookup, proxy provisioning and lifecycle,
//! history download, reconciliation, ledger merge and checkpointing.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use std::fmt::{self, Display};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tradesync_gateway::{
    AccountInformation, DealFetchConfig, DealFetcher, GatewayApi, LifecycleConfig,
    LifecycleController, ProvisionConfig, ProxyId, RemoteAccountProvisioner,
};

use crate::account::{AccountLink, LinkStatus};
use crate::credentials::CredentialCipher;
use crate::error::{SyncError, SyncErrorKind};
use crate::ledger;
use crate::merger::{MergeReport, TradeMerger};
use crate::reconcile::reconcile;

pub mod outcome;
pub mod window;

pub use outcome::SyncOutcome;
use window::select_window;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncStep {
    #[default]
    LookupAccount,
    EnsureProxy,
    Deploy,
    WaitConnected,
    FetchInfo,
    FetchDeals,
    Reconcile,
    Merge,
    UpdateCheckpoint,
    Undeploy,
    Done,
    Failed,
}

impl SyncStep {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LookupAccount => "LOOKUP_ACCOUNT",
            Self::EnsureProxy => "ENSURE_PROXY",
            Self::Deploy => "DEPLOY",
            Self::WaitConnected => "WAIT_CONNECTED",
            Self::FetchInfo => "FETCH_INFO",
            Self::FetchDeals => "FETCH_DEALS",
            Self::Reconcile => "RECONCILE",
            Self::Merge => "MERGE",
            Self::UpdateCheckpoint => "UPDATE_CHECKPOINT",
            Self::Undeploy => "UNDEPLOY",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl Display for SyncStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub provision: ProvisionConfig,
    pub lifecycle: LifecycleConfig,
    pub deals: DealFetchConfig,
    pub lookback_days: i64,
    /// Time granted to plain request/response steps on top of the polling
    /// timeouts when deriving the overall budget.
    pub request_allowance: Duration,
    pub undeploy_grace: Duration,
    /// Replaces the derived budget when set.
    pub overall_budget: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            provision: ProvisionConfig::default(),
            lifecycle: LifecycleConfig::default(),
            deals: DealFetchConfig::default(),
            lookback_days: window::FULL_LOOKBACK_DAYS,
            request_allowance: Duration::from_secs(120),
            undeploy_grace: Duration::from_secs(30),
            overall_budget: None,
        }
    }
}

impl SyncConfig {
    /// Wall-clock limit for one run: the worst case of every waiting step.
    pub fn budget(&self) -> Duration {
        self.overall_budget.unwrap_or_else(|| {
            self.provision
                .max_poll_wait
                .saturating_mul(self.provision.max_polls)
                .saturating_add(self.lifecycle.connect_timeout)
                .saturating_add(self.deals.empty_history_retry_delay)
                .saturating_add(self.request_allowance)
        })
    }
}

#[derive(Debug, Default)]
struct SagaProgress {
    step: SyncStep,
    link_found: bool,
    /// Set once a deploy has been requested for this proxy.
    deployed: Option<ProxyId>,
}

impl SagaProgress {
    fn enter(&mut self, account_id: i64, step: SyncStep) {
        self.step = step;
        info!(account_id, %step, "Sync step");
    }
}

struct SyncSummary {
    report: MergeReport,
    snapshot: Option<AccountInformation>,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone without a stop request: nothing can cancel us any more.
        std::future::pending::<()>().await;
    }
}

#[derive(Debug)]
pub struct SyncOrchestrator<G> {
    gateway: Arc<G>,
    pool: SqlitePool,
    cipher: CredentialCipher,
    provisioner: RemoteAccountProvisioner<G>,
    lifecycle: LifecycleController<G>,
    fetcher: DealFetcher<G>,
    merger: TradeMerger,
    config: SyncConfig,
}

impl<G: GatewayApi> SyncOrchestrator<G> {
    pub fn new(
        gateway: Arc<G>,
        pool: SqlitePool,
        cipher: CredentialCipher,
        config: SyncConfig,
    ) -> Self {
        Self {
            provisioner: RemoteAccountProvisioner::new(gateway.clone(), config.provision.clone()),
            lifecycle: LifecycleController::new(gateway.clone(), config.lifecycle.clone()),
            fetcher: DealFetcher::new(gateway.clone(), config.deals.clone()),
            merger: TradeMerger::new(pool.clone()),
            gateway,
            pool,
            cipher,
            config,
        }
    }

    /// Runs one sync of `account_id`. Callers must make sure no other sync
    /// of the same account is running.
    pub async fn sync(
        &self,
        account_id: i64,
        owner: &str,
        mut shutdown: watch::Receiver<bool>,
    ) -> SyncOutcome {
        let budget = self.config.budget();
        let mut progress = SagaProgress::default();

        let result = tokio::select! {
            result = tokio::time::timeout(budget, self.run(account_id, owner, &mut progress)) => {
                result.unwrap_or(Err(SyncError::BudgetExceeded { budget }))
            }
            () = shutdown_requested(&mut shutdown) => Err(SyncError::Cancelled),
        };

        match result {
            Ok(summary) => self.finish(account_id, &mut progress, summary).await,
            Err(e) => self.fail(account_id, &mut progress, e).await,
        }
    }

    async fn run(
        &self,
        account_id: i64,
        owner: &str,
        progress: &mut SagaProgress,
    ) -> Result<SyncSummary, SyncError> {
        progress.enter(account_id, SyncStep::LookupAccount);
        let link = AccountLink::find(&self.pool, account_id, owner)
            .await?
            .ok_or(SyncError::AccountNotFound { account_id })?;
        progress.link_found = true;

        let credentials = link.credentials(&self.cipher)?;
        AccountLink::set_status(&self.pool, account_id, LinkStatus::Syncing).await?;

        progress.enter(account_id, SyncStep::EnsureProxy);
        let proxy_id = self
            .provisioner
            .ensure_remote_account(link.remote_proxy_id.as_ref(), &credentials)
            .await?;
        if link.remote_proxy_id.as_ref() != Some(&proxy_id) {
            AccountLink::set_remote_proxy(&self.pool, account_id, &proxy_id, None).await?;
        }

        progress.enter(account_id, SyncStep::Deploy);
        progress.deployed = Some(proxy_id.clone());
        self.lifecycle
            .deploy(&proxy_id)
            .await
            .map_err(SyncError::Deploy)?;

        progress.enter(account_id, SyncStep::WaitConnected);
        let remote = self
            .lifecycle
            .wait_connected(&proxy_id, self.lifecycle.connect_timeout())
            .await?;

        let region = remote
            .region
            .or_else(|| link.region.clone())
            .ok_or(SyncError::MissingRegion)?;
        if link.region.as_ref() != Some(&region) {
            AccountLink::set_remote_proxy(&self.pool, account_id, &proxy_id, Some(&region))
                .await?;
        }

        progress.enter(account_id, SyncStep::FetchInfo);
        let snapshot = match self.gateway.account_information(&proxy_id, &region).await {
            Ok(info) => {
                AccountLink::update_snapshot(&self.pool, account_id, &info).await?;
                Some(info)
            }
            Err(e) => {
                warn!(
                    account_id,
                    kind = ?SyncErrorKind::InfoFetchFailed,
                    "Using cached account snapshot: {e}"
                );
                link.snapshot.clone()
            }
        };

        progress.enter(account_id, SyncStep::FetchDeals);
        let has_trades = ledger::count_trades(&self.pool, account_id).await? > 0;
        let (window, history) = select_window(
            Utc::now(),
            link.last_sync_checkpoint,
            has_trades,
            self.config.lookback_days,
        );
        let fetched = self
            .fetcher
            .fetch_deals(&proxy_id, &region, &window, history)
            .await
            .map_err(SyncError::DealFetch)?;
        let fully_observed = fetched.is_fully_observed();

        progress.enter(account_id, SyncStep::Reconcile);
        let reconciliation = reconcile(&fetched.into_deals());
        if reconciliation.orphaned_exits > 0 {
            info!(
                account_id,
                orphaned_exits = reconciliation.orphaned_exits,
                "Skipped positions opened before the window"
            );
        }
        if reconciliation.unclassified_positions > 0 {
            warn!(
                account_id,
                unclassified_positions = reconciliation.unclassified_positions,
                "Skipped positions without opening or closing fills"
            );
        }
        let checkpoint = reconciliation
            .earliest_open_entry()
            .map_or(window.end, |entry| entry.min(window.end));

        progress.enter(account_id, SyncStep::Merge);
        let report = self.merger.merge(account_id, reconciliation.trades).await?;
        if report.is_partial() {
            warn!(
                account_id,
                kind = ?SyncErrorKind::PartialMergeFailure,
                failed_batches = report.failed_batches,
                "Some trade batches were not saved"
            );
        }

        progress.enter(account_id, SyncStep::UpdateCheckpoint);
        if !fully_observed || report.is_partial() {
            info!(
                account_id,
                fully_observed,
                failed_batches = report.failed_batches,
                "Checkpoint left unchanged"
            );
        } else {
            if checkpoint < window.end {
                info!(
                    account_id,
                    held_at = %checkpoint,
                    "Checkpoint held at the oldest open position"
                );
            }
            if link
                .last_sync_checkpoint
                .is_none_or(|current| current < checkpoint)
            {
                AccountLink::advance_checkpoint(&self.pool, account_id, checkpoint).await?;
            }
        }

        Ok(SyncSummary { report, snapshot })
    }

    async fn undeploy(&self, progress: &mut SagaProgress, account_id: i64) {
        let Some(proxy_id) = progress.deployed.take() else {
            return;
        };

        progress.enter(account_id, SyncStep::Undeploy);
        if tokio::time::timeout(self.config.undeploy_grace, self.lifecycle.undeploy(&proxy_id))
            .await
            .is_err()
        {
            warn!(account_id, proxy_id = %proxy_id, "Undeploy did not finish in time");
        }
    }

    async fn finish(
        &self,
        account_id: i64,
        progress: &mut SagaProgress,
        summary: SyncSummary,
    ) -> SyncOutcome {
        self.undeploy(progress, account_id).await;

        if let Err(e) = AccountLink::record_success(&self.pool, account_id, Utc::now()).await {
            error!(account_id, "Failed to record sync success: {e}");
            progress.enter(account_id, SyncStep::Failed);
            return SyncOutcome::failure(SyncErrorKind::Persistence);
        }

        progress.enter(account_id, SyncStep::Done);
        SyncOutcome::Success {
            trades_imported: summary.report.imported(),
            balance: summary.snapshot.as_ref().map(|info| info.balance),
            equity: summary.snapshot.as_ref().map(|info| info.equity),
        }
    }

    async fn fail(
        &self,
        account_id: i64,
        progress: &mut SagaProgress,
        err: SyncError,
    ) -> SyncOutcome {
        let kind = err.kind();
        error!(account_id, step = %progress.step, ?kind, "Sync failed: {err}");

        if let SyncError::ConnectTimeout { .. } = err {
            if let Some(proxy_id) = progress.deployed.take() {
                info!(account_id, proxy_id = %proxy_id, "Leaving proxy deployed after connect timeout");
            }
        } else {
            self.undeploy(progress, account_id).await;
        }

        let recorded = if progress.link_found {
            AccountLink::record_failure(&self.pool, account_id, kind.user_message()).await
        } else {
            Ok(())
        };
        if let Err(e) = recorded {
            error!(account_id, "Failed to record sync failure: {e}");
        }

        progress.enter(account_id, SyncStep::Failed);
        SyncOutcome::failure(kind)
    }
}

/// Object-safe entry point for callers that should not care which gateway
/// the orchestrator talks to.
#[async_trait]
pub trait AccountSync: Send + Sync {
    async fn sync_account(
        &self,
        account_id: i64,
        owner: &str,
        shutdown: watch::Receiver<bool>,
    ) -> SyncOutcome;
}

#[async_trait]
impl<G: GatewayApi> AccountSync for SyncOrchestrator<G> {
    async fn sync_account(
        &self,
        account_id: i64,
        owner: &str,
        shutdown: watch::Receiver<bool>,
    ) -> SyncOutcome {
        self.sync(account_id, owner, shutdown).await
    }
}
