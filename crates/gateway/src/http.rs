use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::Parser;
use reqwest::StatusCode;
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::client::{ensure_success, parse_json, retry_after};
use crate::{
    AccountInformation, CreateAccountResponse, DealEvent, GatewayApi, GatewayError,
    IdempotencyKey, NewRemoteAccount, ProxyId, RateLimitedClient, Region, RemoteAccount,
    RetryPolicy, TransportConfig,
};

const REGION_PLACEHOLDER: &str = "{region}";

#[derive(Parser, Clone)]
pub struct GatewayEnv {
    /// API token for the cloud trading gateway
    #[clap(long, env)]
    pub gateway_token: String,
    #[clap(
        long,
        env,
        default_value = "https://mt-provisioning-api-v1.agiliumtrade.agiliumtrade.ai"
    )]
    pub provisioning_url: String,
    /// Region-scoped client API; `{region}` is replaced with the proxy's region
    #[clap(
        long,
        env,
        default_value = "https://mt-client-api-v1.{region}.agiliumtrade.ai"
    )]
    pub client_api_url: String,
    #[clap(long, env, default_value = "30")]
    pub gateway_request_timeout_secs: u64,
    /// Accept the gateway's certificate chain even when it does not validate
    #[clap(long, env, default_value = "false")]
    pub gateway_relaxed_tls: bool,
}

impl fmt::Debug for GatewayEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayEnv")
            .field("provisioning_url", &self.provisioning_url)
            .field("client_api_url", &self.client_api_url)
            .field(
                "gateway_request_timeout_secs",
                &self.gateway_request_timeout_secs,
            )
            .field("gateway_relaxed_tls", &self.gateway_relaxed_tls)
            .finish_non_exhaustive()
    }
}

impl GatewayEnv {
    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            request_timeout: Duration::from_secs(self.gateway_request_timeout_secs),
            accept_invalid_certs: self.gateway_relaxed_tls,
        }
    }

    pub fn build_gateway(&self, policy: RetryPolicy) -> Result<HttpGateway, GatewayError> {
        let http = RateLimitedClient::new(&self.transport_config(), policy)?;
        HttpGateway::new(
            http,
            &self.provisioning_url,
            &self.client_api_url,
            &self.gateway_token,
        )
    }
}

/// `GatewayApi` over the gateway's REST provisioning and client APIs.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    http: RateLimitedClient,
    provisioning_url: String,
    client_api_url: String,
    headers: HeaderMap,
}

#[derive(Debug, Deserialize)]
struct CreatedAccount {
    #[serde(alias = "_id")]
    id: ProxyId,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DealsPage {
    List(Vec<DealEvent>),
    Wrapped { deals: Vec<DealEvent> },
}

impl From<DealsPage> for Vec<DealEvent> {
    fn from(page: DealsPage) -> Self {
        match page {
            DealsPage::List(deals) | DealsPage::Wrapped { deals } => deals,
        }
    }
}

impl HttpGateway {
    pub fn new(
        http: RateLimitedClient,
        provisioning_url: &str,
        client_api_url: &str,
        token: &str,
    ) -> Result<Self, GatewayError> {
        url::Url::parse(provisioning_url)?;
        url::Url::parse(&client_api_url.replace(REGION_PLACEHOLDER, "region"))?;

        let headers = [
            (
                header::HeaderName::from_static("auth-token"),
                HeaderValue::from_str(token)?,
            ),
            (header::ACCEPT, HeaderValue::from_static("application/json")),
        ]
        .into_iter()
        .collect::<HeaderMap>();

        Ok(Self {
            http,
            provisioning_url: provisioning_url.trim_end_matches('/').to_string(),
            client_api_url: client_api_url.trim_end_matches('/').to_string(),
            headers,
        })
    }

    fn account_url(&self, id: &ProxyId) -> String {
        format!(
            "{}/users/current/accounts/{}",
            self.provisioning_url,
            urlencoding::encode(&id.0)
        )
    }

    fn client_account_url(&self, region: &Region, id: &ProxyId) -> String {
        format!(
            "{}/users/current/accounts/{}",
            self.client_api_url
                .replace(REGION_PLACEHOLDER, &urlencoding::encode(&region.0)),
            urlencoding::encode(&id.0)
        )
    }

    async fn post_lifecycle(&self, action: &str, url: String) -> Result<(), GatewayError> {
        let response = self
            .http
            .execute(action, |http| http.post(&url).headers(self.headers.clone()))
            .await?;

        ensure_success(action, response).await?;
        Ok(())
    }
}

fn format_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl GatewayApi for HttpGateway {
    async fn find_accounts(&self, login: &str) -> Result<Vec<RemoteAccount>, GatewayError> {
        let url = format!("{}/users/current/accounts", self.provisioning_url);

        let response = self
            .http
            .execute("find accounts", |http| {
                http.get(&url)
                    .headers(self.headers.clone())
                    .query(&[("query", login)])
            })
            .await?;

        parse_json("find accounts", response).await
    }

    async fn create_account(
        &self,
        account: &NewRemoteAccount,
        key: &IdempotencyKey,
    ) -> Result<CreateAccountResponse, GatewayError> {
        let url = format!("{}/users/current/accounts", self.provisioning_url);
        let transaction_id = HeaderValue::from_str(key.as_str())?;

        let response = self
            .http
            .execute("create account", |http| {
                http.post(&url)
                    .headers(self.headers.clone())
                    .header("transaction-id", transaction_id.clone())
                    .json(account)
            })
            .await?;

        if response.status() == StatusCode::ACCEPTED {
            let retry_after = retry_after(response.headers());
            debug!(transaction_id = %key, ?retry_after, "Account creation still processing");
            return Ok(CreateAccountResponse::Processing { retry_after });
        }

        let created: CreatedAccount = parse_json("create account", response).await?;
        info!(proxy_id = %created.id, transaction_id = %key, "Remote account created");

        Ok(CreateAccountResponse::Created(created.id))
    }

    async fn get_account(&self, id: &ProxyId) -> Result<RemoteAccount, GatewayError> {
        let url = self.account_url(id);

        let response = self
            .http
            .execute("get account", |http| {
                http.get(&url).headers(self.headers.clone())
            })
            .await?;

        parse_json("get account", response).await
    }

    async fn deploy(&self, id: &ProxyId) -> Result<(), GatewayError> {
        self.post_lifecycle("deploy account", format!("{}/deploy", self.account_url(id)))
            .await
    }

    async fn undeploy(&self, id: &ProxyId) -> Result<(), GatewayError> {
        self.post_lifecycle(
            "undeploy account",
            format!("{}/undeploy", self.account_url(id)),
        )
        .await
    }

    async fn history_deals(
        &self,
        id: &ProxyId,
        region: &Region,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<DealEvent>, GatewayError> {
        let url = format!(
            "{}/history-deals/time/{}/{}",
            self.client_account_url(region, id),
            format_time(start),
            format_time(end)
        );
        let paging = [("offset", offset.to_string()), ("limit", limit.to_string())];

        let response = self
            .http
            .execute("history deals", |http| {
                http.get(&url).headers(self.headers.clone()).query(&paging)
            })
            .await?;

        let page: DealsPage = parse_json("history deals", response).await?;
        Ok(page.into())
    }

    async fn account_information(
        &self,
        id: &ProxyId,
        region: &Region,
    ) -> Result<AccountInformation, GatewayError> {
        let url = format!(
            "{}/account-information",
            self.client_account_url(region, id)
        );

        let response = self
            .http
            .execute("account information", |http| {
                http.get(&url).headers(self.headers.clone())
            })
            .await?;

        parse_json("account information", response).await
    }
}
