use backon::{ConstantBuilder, Retryable};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{ConnectionStatus, DeployState, GatewayApi, GatewayError, ProxyId, RemoteAccount};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Remote proxy did not connect within {waited:?}")]
    ConnectTimeout { waited: Duration },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(150),
        }
    }
}

#[derive(Debug, Error)]
enum PollError {
    #[error("not connected yet ({state:?}, {connection:?})")]
    NotConnected {
        state: DeployState,
        connection: ConnectionStatus,
    },
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl PollError {
    fn keep_polling(&self) -> bool {
        match self {
            Self::NotConnected { .. } => true,
            Self::Gateway(e) => e.is_retryable(),
        }
    }
}

/// Brings a remote proxy online and takes it offline again.
#[derive(Debug)]
pub struct LifecycleController<G> {
    gateway: Arc<G>,
    config: LifecycleConfig,
}

impl<G: GatewayApi> LifecycleController<G> {
    pub const fn new(gateway: Arc<G>, config: LifecycleConfig) -> Self {
        Self { gateway, config }
    }

    pub const fn connect_timeout(&self) -> Duration {
        self.config.connect_timeout
    }

    pub async fn deploy(&self, id: &ProxyId) -> Result<(), GatewayError> {
        self.gateway.deploy(id).await?;
        info!(proxy_id = %id, "Deploy requested");
        Ok(())
    }

    /// Polls the proxy until it is deployed and connected to its broker.
    /// A proxy that fell back to UNDEPLOYED is redeployed while waiting.
    pub async fn wait_connected(
        &self,
        id: &ProxyId,
        timeout: Duration,
    ) -> Result<RemoteAccount, LifecycleError> {
        let poll = || async { self.poll_once(id).await };

        let polling = poll
            .retry(
                ConstantBuilder::default()
                    .with_delay(self.config.poll_interval)
                    .with_max_times(usize::MAX),
            )
            .when(PollError::keep_polling)
            .notify(|e, delay| debug!(proxy_id = %id, ?delay, "Waiting for connection: {e}"));

        match tokio::time::timeout(timeout, polling).await {
            Ok(Ok(account)) => {
                info!(proxy_id = %id, "Remote proxy connected");
                Ok(account)
            }
            Ok(Err(PollError::Gateway(e))) => Err(LifecycleError::Gateway(e)),
            Ok(Err(PollError::NotConnected { .. })) | Err(_) => {
                warn!(proxy_id = %id, ?timeout, "Remote proxy did not connect in time");
                Err(LifecycleError::ConnectTimeout { waited: timeout })
            }
        }
    }

    async fn poll_once(&self, id: &ProxyId) -> Result<RemoteAccount, PollError> {
        let account = self.gateway.get_account(id).await?;

        if account.is_connected() {
            return Ok(account);
        }

        if account.state == DeployState::Undeployed {
            warn!(proxy_id = %id, "Remote proxy fell back to undeployed, redeploying");
            self.gateway.deploy(id).await?;
        }

        Err(PollError::NotConnected {
            state: account.state,
            connection: account.connection_status,
        })
    }

    /// Best effort: a failure here must not mask the sync result.
    pub async fn undeploy(&self, id: &ProxyId) {
        match self.gateway.undeploy(id).await {
            Ok(()) => info!(proxy_id = %id, "Remote proxy undeployed"),
            Err(e) => warn!(proxy_id = %id, "Failed to undeploy remote proxy: {e}"),
        }
    }
}
