use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::GatewayError;

/// Transport policy for the gateway's hosts. Applied to one dedicated
/// `reqwest::Client`, never to process-wide state, so other HTTP users in the
/// same process keep their own trust settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    /// The gateway's domain serves a chain some trust stores reject.
    pub accept_invalid_certs: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            accept_invalid_certs: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per call, first try included.
    pub max_attempts: usize,
    /// Used when a 429 carries no usable `Retry-After`.
    pub default_retry_after: Duration,
    pub server_error_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            default_retry_after: Duration::from_secs(5),
            server_error_backoff: Duration::from_secs(3),
        }
    }
}

/// HTTP client that transparently retries rate-limited (429) and failed
/// (5xx) calls. Everything else is handed back to the caller untouched.
#[derive(Debug, Clone)]
pub struct RateLimitedClient {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl RateLimitedClient {
    pub fn new(transport: &TransportConfig, policy: RetryPolicy) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(transport.request_timeout)
            .danger_accept_invalid_certs(transport.accept_invalid_certs)
            .build()?;

        Ok(Self { client, policy })
    }

    /// Sends the request produced by `build`, rebuilding it for every attempt.
    pub async fn execute<F>(&self, action: &str, build: F) -> Result<Response, GatewayError>
    where
        F: Fn(&reqwest::Client) -> RequestBuilder,
    {
        let mut attempt = 1;

        loop {
            let response = build(&self.client).send().await?;
            let status = response.status();

            let delay = if status == StatusCode::TOO_MANY_REQUESTS {
                retry_after(response.headers()).unwrap_or(self.policy.default_retry_after)
            } else if status.is_server_error() {
                self.policy.server_error_backoff
            } else {
                return Ok(response);
            };

            if attempt >= self.policy.max_attempts {
                let body = response.text().await.unwrap_or_default();
                error!(action, %status, attempts = attempt, "Gateway retry budget exhausted");
                debug!(action, %body, "Last gateway response body");

                return Err(GatewayError::RetriesExhausted {
                    action: action.to_string(),
                    status,
                    attempts: attempt,
                });
            }

            warn!(action, %status, attempt, ?delay, "Gateway asked us to back off, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Seconds-form `Retry-After`. The HTTP-date form is not used by the gateway.
pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) async fn ensure_success(
    action: &str,
    response: Response,
) -> Result<Response, GatewayError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    debug!(action, %status, %body, "Gateway rejected request");

    Err(GatewayError::RequestFailed {
        action: action.to_string(),
        status,
        body,
    })
}

pub(crate) async fn parse_json<T: DeserializeOwned>(
    action: &str,
    response: Response,
) -> Result<T, GatewayError> {
    let response = ensure_success(action, response).await?;
    let response_text = response.text().await?;

    serde_json::from_str(&response_text).map_err(|parse_error| {
        error!(action, %response_text, %parse_error, "Failed to parse gateway response");
        GatewayError::ApiResponseParse {
            action: action.to_string(),
            response_text,
            parse_error: parse_error.to_string(),
        }
    })
}
