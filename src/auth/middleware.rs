//! HTTP-layer token validation.
//!
//! [`authorize_request`] runs before the MCP transport sees a request. It
//! pulls the credential out of the headers, validates it, and either attaches
//! an [`AuthContext`] to the request or answers with a JSON-RPC error body.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::auth::context::AuthContext;
use crate::auth::validator::TokenValidator;
use crate::types::BearerToken;

/// Header carrying a bearer token for clients that cannot set `Authorization`.
pub const API_KEY_HEADER: &str = "x-api-key";

/// JSON-RPC error code: no credential on the request.
pub const TOKEN_REQUIRED_CODE: i64 = -32001;
/// JSON-RPC error code: credential present but rejected.
pub const INVALID_TOKEN_CODE: i64 = -32003;
/// JSON-RPC error code: unexpected server failure.
pub const INTERNAL_ERROR_CODE: i64 = -32603;

/// A transport-level JSON-RPC error reply (`id` is always `null`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcErrorResponse {
    pub status: StatusCode,
    pub code: i64,
    pub message: &'static str,
}

impl RpcErrorResponse {
    pub fn token_required() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: TOKEN_REQUIRED_CODE,
            message: "Authentication token required",
        }
    }

    pub fn invalid_token() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: INVALID_TOKEN_CODE,
            message: "Invalid authentication token",
        }
    }

    pub fn internal_error() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: INTERNAL_ERROR_CODE,
            message: "Internal server error",
        }
    }

    pub fn body(&self) -> serde_json::Value {
        json!({
            "jsonrpc": "2.0",
            "error": {
                "code": self.code,
                "message": self.message,
            },
            "id": null,
        })
    }
}

impl IntoResponse for RpcErrorResponse {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

/// Pull the presented credential out of request headers.
///
/// `Authorization: Bearer` wins (scheme is case-insensitive); otherwise
/// `x-api-key`. Other `Authorization` schemes are ignored. Blank values
/// count as absent.
pub fn extract_credential(headers: &HeaderMap) -> Option<BearerToken> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|value| {
            let (scheme, token) = value.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        })
        .filter(|token| !token.is_empty());

    let token = bearer.or_else(|| {
        headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|token| !token.is_empty())
    })?;

    Some(BearerToken::new(token))
}

/// Middleware: validate the inbound credential and attach the caller's
/// [`AuthContext`] to the request.
pub async fn authorize_request(
    State(validator): State<Arc<TokenValidator>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(token) = extract_credential(req.headers()) else {
        debug!(path = %req.uri().path(), "Request without credential rejected");
        return RpcErrorResponse::token_required().into_response();
    };

    let identity = match validator.authenticate(token.expose()).await {
        Ok(identity) => identity,
        Err(err) => {
            warn!(
                kind = err.kind(),
                error = %err,
                token = %token,
                "Token validation failed"
            );
            return RpcErrorResponse::invalid_token().into_response();
        }
    };

    debug!(subject = %identity.subject(), "Request authenticated");
    AuthContext::new(identity).attach(req.extensions_mut());

    next.run(req).await
}

/// Put every route of `router` behind [`authorize_request`].
pub fn protect<S>(router: Router<S>, validator: Arc<TokenValidator>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(validator, authorize_request))
}
