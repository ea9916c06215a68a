use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::{DealEvent, GatewayApi, GatewayError, ProxyId, Region};

/// Inclusive time range of history to pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Whether the account has ever been synced. A fresh proxy may still be
/// downloading its history, so an empty answer is not trusted right away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Fresh,
    Established,
}

/// Deals pulled for one window, plus whether the window can be considered
/// fully observed.
#[derive(Debug, PartialEq)]
pub struct FetchedDeals {
    deals: Vec<DealEvent>,
    fully_observed: bool,
}

impl FetchedDeals {
    pub fn deals(&self) -> &[DealEvent] {
        &self.deals
    }

    pub const fn is_fully_observed(&self) -> bool {
        self.fully_observed
    }

    pub fn len(&self) -> usize {
        self.deals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deals.is_empty()
    }

    pub fn into_deals(self) -> Vec<DealEvent> {
        self.deals
    }
}

#[derive(Debug, Clone)]
pub struct DealFetchConfig {
    pub page_size: usize,
    pub empty_history_retry_delay: Duration,
    /// Hard stop for pagination against a misbehaving server.
    pub max_pages: usize,
}

impl Default for DealFetchConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            empty_history_retry_delay: Duration::from_secs(15),
            max_pages: 10_000,
        }
    }
}

#[derive(Debug)]
pub struct DealFetcher<G> {
    gateway: Arc<G>,
    config: DealFetchConfig,
}

struct WindowPages {
    deals: Vec<DealEvent>,
    complete: bool,
}

impl<G: GatewayApi> DealFetcher<G> {
    pub const fn new(gateway: Arc<G>, config: DealFetchConfig) -> Self {
        Self { gateway, config }
    }

    pub async fn fetch_deals(
        &self,
        id: &ProxyId,
        region: &Region,
        window: &SyncWindow,
        history: HistoryState,
    ) -> Result<FetchedDeals, GatewayError> {
        let mut pages = self.fetch_window(id, region, window).await?;

        if pages.deals.is_empty() && history == HistoryState::Fresh {
            info!(
                proxy_id = %id,
                delay = ?self.config.empty_history_retry_delay,
                "No deals yet for a new account, retrying once"
            );
            tokio::time::sleep(self.config.empty_history_retry_delay).await;

            pages = self.fetch_window(id, region, window).await?;
            if pages.deals.is_empty() {
                warn!(proxy_id = %id, "History still empty, window not confirmed");
                return Ok(FetchedDeals {
                    deals: Vec::new(),
                    fully_observed: false,
                });
            }
        }

        info!(proxy_id = %id, deals = pages.deals.len(), "Fetched history deals");

        Ok(FetchedDeals {
            deals: pages.deals,
            fully_observed: pages.complete,
        })
    }

    async fn fetch_window(
        &self,
        id: &ProxyId,
        region: &Region,
        window: &SyncWindow,
    ) -> Result<WindowPages, GatewayError> {
        let limit = self.config.page_size.max(1);
        let mut deals = Vec::new();

        for page in 0..self.config.max_pages {
            let batch = self
                .gateway
                .history_deals(id, region, window.start, window.end, deals.len(), limit)
                .await?;

            let received = batch.len();
            deals.extend(batch);
            debug!(proxy_id = %id, page, received, "Fetched history page");

            if received < limit {
                return Ok(WindowPages {
                    deals,
                    complete: true,
                });
            }
        }

        warn!(proxy_id = %id, max_pages = self.config.max_pages, "Stopped paginating at page cap");
        Ok(WindowPages {
            deals,
            complete: false,
        })
    }
}
