use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::warn;

use crate::{
    AccountInformation, ConnectionStatus, CreateAccountResponse, DealEvent, DeployState,
    GatewayApi, GatewayError, IdempotencyKey, NewRemoteAccount, ProxyId, Region, RemoteAccount,
};

/// Gateway operations, as recorded by [`TestGateway`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    FindAccounts,
    CreateAccount,
    GetAccount,
    Deploy,
    Undeploy,
    HistoryDeals,
    AccountInformation,
}

impl GatewayCall {
    const fn action(self) -> &'static str {
        match self {
            Self::FindAccounts => "find accounts",
            Self::CreateAccount => "create account",
            Self::GetAccount => "get account",
            Self::Deploy => "deploy account",
            Self::Undeploy => "undeploy account",
            Self::HistoryDeals => "history deals",
            Self::AccountInformation => "account information",
        }
    }
}

#[derive(Debug)]
struct State {
    accounts: Vec<RemoteAccount>,
    region: Region,
    pending_creations: u32,
    creation_retry_after: Option<Duration>,
    connect_after_polls: Option<u32>,
    polls_since_deploy: u32,
    regress_once: bool,
    deals: Vec<DealEvent>,
    empty_history_calls: u32,
    information: Option<AccountInformation>,
    failures: HashMap<GatewayCall, StatusCode>,
    calls: Vec<GatewayCall>,
    idempotency_keys: Vec<String>,
    next_id: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            accounts: Vec::new(),
            region: Region("london".to_string()),
            pending_creations: 0,
            creation_retry_after: None,
            connect_after_polls: Some(1),
            polls_since_deploy: 0,
            regress_once: false,
            deals: Vec::new(),
            empty_history_calls: 0,
            information: None,
            failures: HashMap::new(),
            calls: Vec::new(),
            idempotency_keys: Vec::new(),
            next_id: 1,
        }
    }
}

/// Scripted in-memory gateway for dry runs and tests. Records every call and
/// plays back the behaviour configured through the `with_*` methods.
#[derive(Debug, Clone, Default)]
pub struct TestGateway {
    state: Arc<Mutex<State>>,
}

impl TestGateway {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn with_account(self, account: RemoteAccount) -> Self {
        self.state().accounts.push(account);
        self
    }

    /// Region assigned to accounts created through this gateway.
    #[must_use]
    pub fn with_region(self, region: &str) -> Self {
        self.state().region = Region(region.to_string());
        self
    }

    /// The next `count` creation calls answer "still processing".
    #[must_use]
    pub fn with_pending_creations(self, count: u32, retry_after: Option<Duration>) -> Self {
        {
            let mut state = self.state();
            state.pending_creations = count;
            state.creation_retry_after = retry_after;
        }
        self
    }

    /// Report CONNECTED from the `polls`-th status read after a deploy.
    #[must_use]
    pub fn connects_after(self, polls: u32) -> Self {
        self.state().connect_after_polls = Some(polls);
        self
    }

    #[must_use]
    pub fn never_connects(self) -> Self {
        self.state().connect_after_polls = None;
        self
    }

    /// The first status read after a deploy finds the account undeployed.
    #[must_use]
    pub fn regresses_once(self) -> Self {
        self.state().regress_once = true;
        self
    }

    #[must_use]
    pub fn with_deals(self, deals: Vec<DealEvent>) -> Self {
        self.state().deals = deals;
        self
    }

    /// The first `calls` history requests return nothing, as a terminal that
    /// has not finished downloading its history does.
    #[must_use]
    pub fn with_empty_history(self, calls: u32) -> Self {
        self.state().empty_history_calls = calls;
        self
    }

    #[must_use]
    pub fn with_account_information(self, information: AccountInformation) -> Self {
        self.state().information = Some(information);
        self
    }

    /// Every `call` fails with `status` until [`Self::recover`] is called.
    #[must_use]
    pub fn failing(self, call: GatewayCall, status: StatusCode) -> Self {
        self.state().failures.insert(call, status);
        self
    }

    pub fn recover(&self, call: GatewayCall) {
        self.state().failures.remove(&call);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state().calls.clone()
    }

    pub fn count(&self, call: GatewayCall) -> usize {
        self.state().calls.iter().filter(|c| **c == call).count()
    }

    pub fn idempotency_keys(&self) -> Vec<String> {
        self.state().idempotency_keys.clone()
    }

    pub fn account(&self, id: &ProxyId) -> Option<RemoteAccount> {
        self.state().accounts.iter().find(|a| &a.id == id).cloned()
    }

    fn record(&self, call: GatewayCall) -> Result<MutexGuard<'_, State>, GatewayError> {
        let mut state = self.state();
        state.calls.push(call);

        if let Some(status) = state.failures.get(&call) {
            warn!("[TEST] Injected failure for {}", call.action());
            return Err(GatewayError::RequestFailed {
                action: call.action().to_string(),
                status: *status,
                body: "injected failure".to_string(),
            });
        }

        Ok(state)
    }
}

fn not_found(call: GatewayCall, id: &ProxyId) -> GatewayError {
    GatewayError::RequestFailed {
        action: call.action().to_string(),
        status: StatusCode::NOT_FOUND,
        body: format!("account {id} not found"),
    }
}

impl State {
    fn account_mut(&mut self, id: &ProxyId) -> Option<&mut RemoteAccount> {
        self.accounts.iter_mut().find(|a| &a.id == id)
    }
}

#[async_trait]
impl GatewayApi for TestGateway {
    async fn find_accounts(&self, login: &str) -> Result<Vec<RemoteAccount>, GatewayError> {
        let state = self.record(GatewayCall::FindAccounts)?;

        Ok(state
            .accounts
            .iter()
            .filter(|a| a.login == login)
            .cloned()
            .collect())
    }

    async fn create_account(
        &self,
        account: &NewRemoteAccount,
        key: &IdempotencyKey,
    ) -> Result<CreateAccountResponse, GatewayError> {
        let mut state = self.record(GatewayCall::CreateAccount)?;
        state.idempotency_keys.push(key.as_str().to_string());

        if state.pending_creations > 0 {
            state.pending_creations -= 1;
            return Ok(CreateAccountResponse::Processing {
                retry_after: state.creation_retry_after,
            });
        }

        let id = ProxyId(format!("proxy-{}", state.next_id));
        state.next_id += 1;
        let region = state.region.clone();

        state.accounts.push(RemoteAccount {
            id: id.clone(),
            login: account.login.clone(),
            server: account.server.clone(),
            region: Some(region),
            state: DeployState::NotDeployed,
            connection_status: ConnectionStatus::Disconnected,
        });

        Ok(CreateAccountResponse::Created(id))
    }

    async fn get_account(&self, id: &ProxyId) -> Result<RemoteAccount, GatewayError> {
        let mut state = self.record(GatewayCall::GetAccount)?;
        state.polls_since_deploy += 1;

        let polls = state.polls_since_deploy;
        let connect_after = state.connect_after_polls;
        let regress = std::mem::take(&mut state.regress_once);

        let account = state
            .account_mut(id)
            .ok_or_else(|| not_found(GatewayCall::GetAccount, id))?;

        let deployed = account.state == DeployState::Deployed;
        if deployed && regress {
            account.state = DeployState::Undeployed;
            account.connection_status = ConnectionStatus::Disconnected;
        } else if deployed && connect_after.is_some_and(|after| polls >= after) {
            account.connection_status = ConnectionStatus::Connected;
        }
        let snapshot = account.clone();

        if regress && !deployed {
            state.regress_once = true;
        }

        Ok(snapshot)
    }

    async fn deploy(&self, id: &ProxyId) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::Deploy)?;
        state.polls_since_deploy = 0;

        let account = state
            .account_mut(id)
            .ok_or_else(|| not_found(GatewayCall::Deploy, id))?;
        account.state = DeployState::Deployed;
        Ok(())
    }

    async fn undeploy(&self, id: &ProxyId) -> Result<(), GatewayError> {
        let mut state = self.record(GatewayCall::Undeploy)?;

        let account = state
            .account_mut(id)
            .ok_or_else(|| not_found(GatewayCall::Undeploy, id))?;
        account.state = DeployState::Undeployed;
        account.connection_status = ConnectionStatus::Disconnected;
        Ok(())
    }

    async fn history_deals(
        &self,
        _id: &ProxyId,
        _region: &Region,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DealEvent>, GatewayError> {
        let mut state = self.record(GatewayCall::HistoryDeals)?;

        if state.empty_history_calls > 0 {
            state.empty_history_calls -= 1;
            return Ok(Vec::new());
        }

        Ok(state
            .deals
            .iter()
            .filter(|deal| deal.time >= start && deal.time <= end)
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn account_information(
        &self,
        id: &ProxyId,
        _region: &Region,
    ) -> Result<AccountInformation, GatewayError> {
        let state = self.record(GatewayCall::AccountInformation)?;

        state
            .information
            .clone()
            .ok_or_else(|| not_found(GatewayCall::AccountInformation, id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remote(id: &str, login: &str) -> RemoteAccount {
        RemoteAccount {
            id: ProxyId(id.to_string()),
            login: login.to_string(),
            server: "Broker-Live".to_string(),
            region: Some(Region("london".to_string())),
            state: DeployState::Undeployed,
            connection_status: ConnectionStatus::Disconnected,
        }
    }

    #[tokio::test]
    async fn test_connects_after_configured_polls() {
        let gateway = TestGateway::new()
            .with_account(remote("abc", "1234"))
            .connects_after(2);
        let id = ProxyId("abc".to_string());

        gateway.deploy(&id).await.unwrap();
        assert!(!gateway.get_account(&id).await.unwrap().is_connected());
        assert!(gateway.get_account(&id).await.unwrap().is_connected());

        gateway.undeploy(&id).await.unwrap();
        assert_eq!(
            gateway.account(&id).unwrap().state,
            DeployState::Undeployed
        );
    }

    #[tokio::test]
    async fn test_injected_failures_until_recovered() {
        let gateway = TestGateway::new()
            .with_account(remote("abc", "1234"))
            .failing(GatewayCall::Deploy, StatusCode::BAD_GATEWAY);
        let id = ProxyId("abc".to_string());

        let err = gateway.deploy(&id).await.unwrap_err();
        assert!(err.is_retryable());

        gateway.recover(GatewayCall::Deploy);
        gateway.deploy(&id).await.unwrap();
        assert_eq!(gateway.count(GatewayCall::Deploy), 2);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_found() {
        let gateway = TestGateway::new();
        let err = gateway
            .get_account(&ProxyId("missing".to_string()))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            GatewayError::RequestFailed { status, .. } if status == StatusCode::NOT_FOUND
        ));
    }

    #[tokio::test]
    async fn test_find_accounts_filters_by_login() {
        let gateway = TestGateway::new()
            .with_account(remote("a", "1234"))
            .with_account(remote("b", "5678"));

        let found = gateway.find_accounts("5678").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, ProxyId("b".to_string()));
        assert_eq!(gateway.calls(), vec![GatewayCall::FindAccounts]);
    }
}
