use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod client;
pub mod deals;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod models;
pub mod provisioner;
pub mod test;

pub use client::{RateLimitedClient, RetryPolicy, TransportConfig};
pub use deals::{DealFetchConfig, DealFetcher, FetchedDeals, HistoryState, SyncWindow};
pub use error::GatewayError;
pub use http::{GatewayEnv, HttpGateway};
pub use lifecycle::{LifecycleConfig, LifecycleController, LifecycleError};
pub use models::{
    AccountCredentials, AccountInformation, ConnectionStatus, CreateAccountResponse, DealEvent,
    DealRole, DealSide, DeployState, IdempotencyKey, NewRemoteAccount, Platform, ProxyId, Region,
    RemoteAccount,
};
pub use provisioner::{ProvisionConfig, ProvisionError, RemoteAccountProvisioner};
pub use test::{GatewayCall, TestGateway};

/// Raw calls against the cloud trading gateway. Provisioning, lifecycle and
/// history logic is written against this trait so it can run on top of the
/// HTTP implementation or a scripted in-memory one.
#[async_trait]
pub trait GatewayApi: Send + Sync + 'static {
    /// Remote accounts whose login matches `login`, on any server.
    async fn find_accounts(&self, login: &str) -> Result<Vec<RemoteAccount>, GatewayError>;

    /// Creates a remote account, or reports progress on the creation
    /// previously started with the same `key`.
    async fn create_account(
        &self,
        account: &NewRemoteAccount,
        key: &IdempotencyKey,
    ) -> Result<CreateAccountResponse, GatewayError>;

    async fn get_account(&self, id: &ProxyId) -> Result<RemoteAccount, GatewayError>;

    async fn deploy(&self, id: &ProxyId) -> Result<(), GatewayError>;

    async fn undeploy(&self, id: &ProxyId) -> Result<(), GatewayError>;

    /// One page of history deals with `time` inside `[start, end]`.
    async fn history_deals(
        &self,
        id: &ProxyId,
        region: &Region,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DealEvent>, GatewayError>;

    async fn account_information(
        &self,
        id: &ProxyId,
        region: &Region,
    ) -> Result<AccountInformation, GatewayError>;
}
