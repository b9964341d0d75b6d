//! The token-source capability shared by the delegation and API client layers.

use std::future::Future;
use std::pin::Pin;

use crate::delegation::DelegationError;
use crate::types::{BearerToken, ScopeSet};

/// A bearer token with its expiry, as handed out by a [`TokenProvider`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: BearerToken,
    /// Seconds since the epoch.
    pub expires_at: i64,
}

impl AccessToken {
    pub fn new(token: BearerToken, expires_at: i64) -> Self {
        Self { token, expires_at }
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Boxed future returned by [`TokenProvider::get_token`].
pub type TokenFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AccessToken, DelegationError>> + Send + 'a>>;

/// Anything that can produce a bearer token for a set of scopes.
///
/// Consumers such as [`AuthenticatedClient`](crate::api_client::AuthenticatedClient)
/// hold an `Arc<dyn TokenProvider>` and never see which identity provider
/// sits behind it.
pub trait TokenProvider: Send + Sync {
    fn get_token<'a>(&'a self, scopes: &'a ScopeSet) -> TokenFuture<'a>;
}

/// A fixed, pre-acquired token (raw credential source).
///
/// Scopes are ignored; the token is returned as-is until it expires, after
/// which the caller gets it back expired and the downstream API decides.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: AccessToken,
}

impl StaticTokenProvider {
    pub fn new(token: AccessToken) -> Self {
        Self { token }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn get_token<'a>(&'a self, _scopes: &'a ScopeSet) -> TokenFuture<'a> {
        Box::pin(std::future::ready(Ok(self.token.clone())))
    }
}
