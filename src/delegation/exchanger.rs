//! On-behalf-of token exchange.
//!
//! The server presents the caller's verified token (the *assertion*) together
//! with its own client credentials to the identity provider's token endpoint
//! and receives a token for a downstream API that still names the original
//! user.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::VerifiedIdentity;
use crate::delegation::provider::{AccessToken, TokenFuture, TokenProvider};
use crate::types::{BearerToken, ScopeSet, Subject};
use crate::utils::truncate_chars;

/// Default Entra ID authority.
pub const DEFAULT_AUTHORITY_HOST: &str = "https://login.microsoftonline.com";

/// Default timeout for one exchange request.
pub const DEFAULT_EXCHANGE_TIMEOUT_SECONDS: u64 = 30;

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ON_BEHALF_OF: &str = "on_behalf_of";

/// Longest provider body kept in an error.
const MAX_ERROR_BODY: usize = 512;

/// Server credentials and endpoint for the exchange.
#[derive(Clone, PartialEq, Eq)]
pub struct DelegationConfig {
    pub authority_host: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    pub timeout: Duration,
}

impl fmt::Debug for DelegationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegationConfig")
            .field("authority_host", &self.authority_host)
            .field("tenant_id", &self.tenant_id)
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl DelegationConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            authority_host: DEFAULT_AUTHORITY_HOST.to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            timeout: Duration::from_secs(DEFAULT_EXCHANGE_TIMEOUT_SECONDS),
        }
    }

    pub fn with_authority_host(mut self, host: impl Into<String>) -> Self {
        self.authority_host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// `{authority}/{tenant}/oauth2/v2.0/token`
    pub fn token_endpoint(&self) -> Result<Url, DelegationError> {
        let raw = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_host.trim_end_matches('/'),
            self.tenant_id
        );
        Url::parse(&raw).map_err(|e| DelegationError::Unreachable(format!("{}: {}", raw, e)))
    }
}

/// Errors from a delegation exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    /// The user token cannot be used as an assertion (expired or empty).
    #[error("Invalid assertion: {0}")]
    InvalidAssertion(String),
    /// The identity provider refused the exchange (e.g. consent not granted).
    #[error("Identity provider rejected exchange: {code}: {description}")]
    ProviderError { code: String, description: String },
    /// Network failure or timeout talking to the token endpoint.
    #[error("Token endpoint unreachable: {0}")]
    Unreachable(String),
}

/// One exchange: whose token, for which downstream scopes.
///
/// Only buildable from a [`VerifiedIdentity`], so an unverified token can
/// never reach the token endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationRequest {
    user_assertion: BearerToken,
    target_scopes: ScopeSet,
    subject: Subject,
    assertion_expires_at: i64,
}

impl DelegationRequest {
    pub fn new(identity: &VerifiedIdentity, target_scopes: ScopeSet) -> Self {
        Self {
            user_assertion: identity.raw_token().clone(),
            target_scopes,
            subject: identity.subject().clone(),
            assertion_expires_at: identity.expires_at(),
        }
    }

    pub fn user_assertion(&self) -> &BearerToken {
        &self.user_assertion
    }

    pub fn target_scopes(&self) -> &ScopeSet {
        &self.target_scopes
    }

    pub fn subject(&self) -> &Subject {
        &self.subject
    }
}

/// Token minted for a downstream API on behalf of a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegatedToken {
    pub token: BearerToken,
    /// Seconds since the epoch.
    pub expires_at: i64,
    pub target_scopes: ScopeSet,
}

impl From<DelegatedToken> for AccessToken {
    fn from(delegated: DelegatedToken) -> Self {
        AccessToken::new(delegated.token, delegated.expires_at)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: String,
}

/// Delegated tokens keyed by `(subject, sorted scopes)`.
#[derive(Debug)]
struct DelegationCache {
    safety_margin: i64,
    entries: DashMap<(Subject, String), DelegatedToken>,
}

impl DelegationCache {
    fn get(&self, key: &(Subject, String), now: i64) -> Option<DelegatedToken> {
        let hit = self.entries.get(key).map(|entry| entry.value().clone())?;
        if now.saturating_add(self.safety_margin) < hit.expires_at {
            return Some(hit);
        }
        self.entries.remove(key);
        None
    }
}

/// Performs on-behalf-of exchanges against the configured token endpoint.
///
/// No caching unless [`with_cache`](Self::with_cache) is used.
pub struct DelegationExchanger {
    config: DelegationConfig,
    client: reqwest::Client,
    cache: Option<DelegationCache>,
}

impl DelegationExchanger {
    pub fn new(config: DelegationConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            cache: None,
        }
    }

    /// Reuse delegated tokens per subject and scope set until `safety_margin`
    /// before they expire.
    pub fn with_cache(mut self, safety_margin: Duration) -> Self {
        self.cache = Some(DelegationCache {
            safety_margin: i64::try_from(safety_margin.as_secs()).unwrap_or(i64::MAX),
            entries: DashMap::new(),
        });
        self
    }

    pub fn config(&self) -> &DelegationConfig {
        &self.config
    }

    /// Exchange the request's user assertion for a token scoped to its target scopes.
    pub async fn exchange(
        &self,
        request: &DelegationRequest,
    ) -> Result<DelegatedToken, DelegationError> {
        let now = chrono::Utc::now().timestamp();

        if request.user_assertion.is_empty() {
            return Err(DelegationError::InvalidAssertion("empty assertion".to_string()));
        }
        if request.assertion_expires_at <= now {
            return Err(DelegationError::InvalidAssertion(
                "assertion has expired".to_string(),
            ));
        }

        let cache_key = (request.subject.clone(), request.target_scopes.to_delimited());
        if let Some(cache) = &self.cache
            && let Some(hit) = cache.get(&cache_key, now)
        {
            debug!(
                subject = %request.subject,
                scopes = %request.target_scopes,
                "Delegated token cache hit"
            );
            return Ok(hit);
        }

        let delegated = self.request_token(request, now).await?;

        if let Some(cache) = &self.cache {
            cache.entries.insert(cache_key, delegated.clone());
        }
        Ok(delegated)
    }

    async fn request_token(
        &self,
        request: &DelegationRequest,
        now: i64,
    ) -> Result<DelegatedToken, DelegationError> {
        let endpoint = self.config.token_endpoint()?;
        let scope = request.target_scopes.to_delimited();

        debug!(
            subject = %request.subject,
            scopes = %scope,
            assertion = %request.user_assertion,
            "Requesting on-behalf-of token"
        );

        let form = [
            ("grant_type", JWT_BEARER_GRANT),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("assertion", request.user_assertion.expose()),
            ("scope", scope.as_str()),
            ("requested_token_use", ON_BEHALF_OF),
        ];

        let timeout = self.config.timeout;
        let response = self
            .client
            .post(endpoint)
            .timeout(timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DelegationError::Unreachable(format!("timed out after {:?}", timeout))
                } else {
                    DelegationError::Unreachable(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DelegationError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            let error = match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(parsed) => DelegationError::ProviderError {
                    code: parsed.error,
                    description: parsed.error_description,
                },
                Err(_) => DelegationError::ProviderError {
                    code: format!("http_{}", status.as_u16()),
                    description: truncate_chars(&body, MAX_ERROR_BODY),
                },
            };
            warn!(
                subject = %request.subject,
                status = %status,
                "On-behalf-of exchange rejected: {}",
                error
            );
            return Err(error);
        }

        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| DelegationError::ProviderError {
                code: "invalid_response".to_string(),
                description: e.to_string(),
            })?;

        let delegated = DelegatedToken {
            token: BearerToken::new(parsed.access_token),
            expires_at: now.saturating_add(parsed.expires_in),
            target_scopes: request.target_scopes.clone(),
        };
        info!(
            subject = %request.subject,
            scopes = %scope,
            token = %delegated.token,
            "Delegated token acquired"
        );
        Ok(delegated)
    }
}

/// A [`TokenProvider`] that mints delegated tokens for one verified user.
///
/// Built per request from the caller's identity; requested scopes become the
/// target scopes of the exchange.
pub struct OnBehalfOfCredential {
    exchanger: Arc<DelegationExchanger>,
    identity: VerifiedIdentity,
}

impl OnBehalfOfCredential {
    pub fn new(exchanger: Arc<DelegationExchanger>, identity: VerifiedIdentity) -> Self {
        Self {
            exchanger,
            identity,
        }
    }

    pub fn subject(&self) -> &Subject {
        self.identity.subject()
    }
}

impl TokenProvider for OnBehalfOfCredential {
    fn get_token<'a>(&'a self, scopes: &'a ScopeSet) -> TokenFuture<'a> {
        Box::pin(async move {
            let request = DelegationRequest::new(&self.identity, scopes.clone());
            self.exchanger
                .exchange(&request)
                .await
                .map(AccessToken::from)
        })
    }
}
