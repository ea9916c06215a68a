use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::{
    AccountCredentials, CreateAccountResponse, GatewayApi, GatewayError, IdempotencyKey,
    NewRemoteAccount, ProxyId,
};

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("Remote account still being created after {polls} polls")]
    Timeout { polls: u32 },
}

#[derive(Debug, Clone)]
pub struct ProvisionConfig {
    /// Re-polls of an accepted creation request before giving up.
    pub max_polls: u32,
    pub default_poll_wait: Duration,
    pub max_poll_wait: Duration,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            max_polls: 15,
            default_poll_wait: Duration::from_secs(5),
            max_poll_wait: Duration::from_secs(30),
        }
    }
}

/// Finds or creates the remote proxy for a broker login.
#[derive(Debug)]
pub struct RemoteAccountProvisioner<G> {
    gateway: Arc<G>,
    config: ProvisionConfig,
}

impl<G: GatewayApi> RemoteAccountProvisioner<G> {
    pub const fn new(gateway: Arc<G>, config: ProvisionConfig) -> Self {
        Self { gateway, config }
    }

    pub async fn ensure_remote_account(
        &self,
        existing: Option<&ProxyId>,
        credentials: &AccountCredentials,
    ) -> Result<ProxyId, ProvisionError> {
        if let Some(id) = existing {
            debug!(proxy_id = %id, "Account already linked to a remote proxy");
            return Ok(id.clone());
        }

        let candidates = self.gateway.find_accounts(&credentials.login).await?;
        if let Some(found) = candidates
            .into_iter()
            .find(|account| account.matches_login(&credentials.login, &credentials.server))
        {
            info!(
                proxy_id = %found.id,
                login = %credentials.login,
                server = %credentials.server,
                "Reusing existing remote proxy"
            );
            return Ok(found.id);
        }

        self.create(credentials).await
    }

    async fn create(&self, credentials: &AccountCredentials) -> Result<ProxyId, ProvisionError> {
        let request = NewRemoteAccount::from(credentials);
        let key = IdempotencyKey::generate();
        let mut polls = 0;

        info!(login = %credentials.login, server = %credentials.server, transaction_id = %key, "Creating remote proxy");

        loop {
            match self.gateway.create_account(&request, &key).await? {
                CreateAccountResponse::Created(id) => return Ok(id),
                CreateAccountResponse::Processing { retry_after } => {
                    if polls >= self.config.max_polls {
                        warn!(transaction_id = %key, polls, "Remote proxy creation did not finish");
                        return Err(ProvisionError::Timeout { polls });
                    }

                    let wait = retry_after
                        .unwrap_or(self.config.default_poll_wait)
                        .min(self.config.max_poll_wait);
                    debug!(transaction_id = %key, ?wait, polls, "Remote proxy creation in progress");

                    tokio::time::sleep(wait).await;
                    polls += 1;
                }
            }
        }
    }
}
