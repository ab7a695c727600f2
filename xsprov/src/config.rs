//! Provider configuration and the per-operation context.

use std::fmt;
use std::sync::Arc;

use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::{ProviderError, RemoteContext, Result};
use crate::xapi::{Connector, Session, host_address, host_url};

/// Coordinator connection settings.
#[derive(Args, Clone, Default)]
pub struct ProviderConfig {
    /// Pool coordinator address, e.g. https://10.0.0.1
    #[arg(long, env = "XENSERVER_HOST", default_value = "")]
    pub host: String,

    /// User name for the coordinator
    #[arg(long, env = "XENSERVER_USERNAME", default_value = "")]
    pub username: String,

    /// Password for the coordinator
    #[arg(long, env = "XENSERVER_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,
}

impl fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl ProviderConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Reject empty settings and normalize the host into a URL.
    pub fn validate(mut self) -> Result<Self> {
        if self.host.trim().is_empty() {
            return Err(ProviderError::MissingConfig("host"));
        }
        if self.username.is_empty() {
            return Err(ProviderError::MissingConfig("username"));
        }
        if self.password.is_empty() {
            return Err(ProviderError::MissingConfig("password"));
        }
        self.host = host_url(&self.host);
        Ok(self)
    }

    /// Bare coordinator address, as joining hosts are told to use.
    pub fn address(&self) -> &str {
        host_address(&self.host)
    }
}

/// Everything a reconciler call needs: the coordinator session, its
/// credentials for opening sessions against other hosts, and the token that
/// cancels every wait in the operation.
#[derive(Clone)]
pub struct ProviderContext {
    pub session: Session,
    pub config: ProviderConfig,
    pub connector: Arc<dyn Connector>,
    pub cancel: CancellationToken,
}

impl ProviderContext {
    /// Validate `config` and log in to the coordinator.
    pub async fn connect(
        config: ProviderConfig,
        connector: Arc<dyn Connector>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let config = config.validate()?;
        let session = connector
            .connect(&config.host, &config.username, &config.password)
            .await
            .remote("session.login_with_password", &config.host)?;
        info!(host = %config.address(), "connected to coordinator");
        Ok(Self {
            session,
            config,
            connector,
            cancel,
        })
    }
}
