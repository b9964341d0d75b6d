//! Server configuration.
//!
//! The binary fills a [`ServerConfig`] from command-line flags and
//! environment variables; [`ServerConfig::validate`] is run before anything
//! is bound or fetched.

use std::net::SocketAddr;
use std::time::Duration;

use url::Url;

use crate::auth::{KeySetConfig, ValidatorConfig};
use crate::delegation::DelegationConfig;
use crate::types::{Issuer, ScopeSet};

pub const DEFAULT_BIND: &str = "0.0.0.0:3000";
pub const DEFAULT_BACKEND_URL: &str = "https://graph.microsoft.com";
pub const DEFAULT_BACKEND_SCOPES: &str = "https://graph.microsoft.com/.default";
pub const DEFAULT_REQUEST_TIMEOUT_SECONDS: u64 = 120;
pub const DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS: u64 = 300;

/// v2 issuer of an Entra ID tenant.
pub fn tenant_issuer(tenant_id: &str) -> Issuer {
    Issuer::new(format!("https://login.microsoftonline.com/{}/v2.0", tenant_id))
}

/// Configuration errors, reported at startup.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("no trusted token issuer configured (set TOKEN_ISSUER or AZURE_TENANT_ID)")]
    NoTrustedIssuers,
    #[error("delegation credentials incomplete: {0} is missing")]
    IncompleteDelegation(&'static str),
    #[error("invalid bind address '{0}'")]
    InvalidBind(String),
    #[error("invalid backend API URL '{0}'")]
    InvalidBackendUrl(String),
    #[error("session idle timeout must be greater than zero")]
    ZeroSessionIdleTimeout,
}

/// Everything needed to run the server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub validator: ValidatorConfig,
    pub key_set: KeySetConfig,
    /// Enables the `list_tenant_users` tool.
    pub delegation: Option<DelegationConfig>,
    /// Cache delegated tokens, refreshing this long before expiry.
    pub delegation_cache_margin: Option<Duration>,
    pub backend_url: String,
    pub backend_scopes: ScopeSet,
    pub bind: String,
    /// Keep protocol sessions and track identity per connection.
    pub stateful: bool,
    /// Stateful sessions with no traffic for this long are closed and their
    /// identity cleared.
    pub session_idle_timeout: Duration,
    pub request_timeout: Duration,
}

impl ServerConfig {
    pub fn new(validator: ValidatorConfig) -> Self {
        Self {
            validator,
            key_set: KeySetConfig::default(),
            delegation: None,
            delegation_cache_margin: None,
            backend_url: DEFAULT_BACKEND_URL.to_string(),
            backend_scopes: ScopeSet::from_delimited(DEFAULT_BACKEND_SCOPES),
            bind: DEFAULT_BIND.to_string(),
            stateful: false,
            session_idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    /// Build delegation settings from optional parts.
    ///
    /// All absent means delegation is off; some but not all present is an error.
    pub fn delegation_from_parts(
        tenant_id: Option<String>,
        client_id: Option<String>,
        client_secret: Option<String>,
    ) -> Result<Option<DelegationConfig>, ConfigError> {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if !present(&client_id) && !present(&client_secret) {
            return Ok(None);
        }

        let tenant_id = tenant_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::IncompleteDelegation("AZURE_TENANT_ID"))?;
        let client_id = client_id
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::IncompleteDelegation("AZURE_CLIENT_ID"))?;
        let client_secret = client_secret
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::IncompleteDelegation("AZURE_CLIENT_SECRET"))?;

        Ok(Some(DelegationConfig::new(tenant_id, client_id, client_secret)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.validator.trusted_issuers.is_empty() {
            return Err(ConfigError::NoTrustedIssuers);
        }

        if let Some(delegation) = &self.delegation {
            if delegation.tenant_id.trim().is_empty() {
                return Err(ConfigError::IncompleteDelegation("AZURE_TENANT_ID"));
            }
            if delegation.client_id.trim().is_empty() {
                return Err(ConfigError::IncompleteDelegation("AZURE_CLIENT_ID"));
            }
            if delegation.client_secret.trim().is_empty() {
                return Err(ConfigError::IncompleteDelegation("AZURE_CLIENT_SECRET"));
            }
        }

        if self.session_idle_timeout.is_zero() {
            return Err(ConfigError::ZeroSessionIdleTimeout);
        }

        self.bind
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidBind(self.bind.clone()))?;
        Url::parse(&self.backend_url)
            .map_err(|_| ConfigError::InvalidBackendUrl(self.backend_url.clone()))?;

        Ok(())
    }
}
