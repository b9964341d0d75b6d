//! HTTP client for a downstream REST API that authenticates with a token
//! obtained from a [`TokenProvider`].

use std::sync::Arc;

use reqwest::RequestBuilder;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::delegation::{AccessToken, DelegationError, TokenProvider};
use crate::types::{BearerToken, ScopeSet};
use crate::utils::truncate_chars;

/// Path of the signed-in user's profile on Microsoft Graph style APIs.
pub const CURRENT_USER_PATH: &str = "/v1.0/me";

/// Longest downstream body kept in an error.
const MAX_ERROR_BODY: usize = 1024;

/// Errors from a downstream API call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No token could be obtained for the call.
    #[error("Token acquisition failed: {0}")]
    Token(#[from] DelegationError),
    /// The API answered with a non-success status.
    #[error("Downstream API returned HTTP {status}")]
    Downstream { status: u16, body: String },
    #[error("Downstream API unreachable: {0}")]
    Transport(String),
    #[error("Unexpected downstream response body: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status for [`ApiError::Downstream`].
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Downstream { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Calls `base_url` with `Authorization: Bearer <token>`.
///
/// The token is fetched from the provider on first use and again whenever
/// the held one has expired. Nothing is refreshed ahead of expiry and failed
/// calls are not retried.
pub struct AuthenticatedClient {
    base_url: String,
    provider: Arc<dyn TokenProvider>,
    scopes: ScopeSet,
    http: reqwest::Client,
    current: Mutex<Option<AccessToken>>,
}

impl AuthenticatedClient {
    pub fn new(
        base_url: impl Into<String>,
        provider: Arc<dyn TokenProvider>,
        scopes: ScopeSet,
        http: reqwest::Client,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            provider,
            scopes,
            http,
            current: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET {base_url}{path}`, decoding the JSON response.
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let request = self.http.get(self.url(path));
        self.send(request).await
    }

    /// `POST {base_url}{path}` with `body` as JSON, decoding the JSON response.
    pub async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body).map_err(|e| ApiError::Decode(e.to_string()))?;
        let request = self.http.post(self.url(path)).body(payload);
        self.send(request).await
    }

    /// The signed-in user's profile.
    pub async fn current_user(&self) -> Result<serde_json::Value, ApiError> {
        self.get(CURRENT_USER_PATH).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Current token, acquiring a new one if none is held or it has expired.
    async fn bearer(&self) -> Result<BearerToken, ApiError> {
        let mut current = self.current.lock().await;
        let now = chrono::Utc::now().timestamp();

        if let Some(token) = current.as_ref()
            && !token.is_expired_at(now)
        {
            return Ok(token.token.clone());
        }

        let fresh = self.provider.get_token(&self.scopes).await?;
        debug!(scopes = %self.scopes, token = %fresh.token, "Acquired downstream token");
        let bearer = fresh.token.clone();
        *current = Some(fresh);
        Ok(bearer)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ApiError> {
        let token = self.bearer().await?;

        let response = request
            .bearer_auth(token.expose())
            .header(CONTENT_TYPE, "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        if !status.is_success() {
            warn!(status = %status, "Downstream API call failed");
            return Err(ApiError::Downstream {
                status: status.as_u16(),
                body: truncate_chars(&body, MAX_ERROR_BODY),
            });
        }

        if body.trim().is_empty() {
            return serde_json::from_value(serde_json::Value::Null)
                .map_err(|e| ApiError::Decode(e.to_string()));
        }
        serde_json::from_str(&body).map_err(|e| ApiError::Decode(e.to_string()))
    }
}
