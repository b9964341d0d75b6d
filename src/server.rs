//! MCP server implementation using rmcp.
//!
//! Provides the protocol handler and the HTTP wiring: `/mcp` behind the token
//! validation middleware, `/health` open.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{
    ErrorData as McpError,
    handler::server::ServerHandler,
    model::*,
    service::{RequestContext, RoleServer},
};
use serde_json::json;
use tokio::sync::RwLock;
use tower_http::{
    catch_panic::CatchPanicLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};
use tracing::{error, info, warn};

use crate::auth::{
    AuthContext, ConnectionAuthStore, ConnectionLease, KeySetCache, RpcErrorResponse,
    TokenValidator, protect,
};
use crate::config::{
    DEFAULT_REQUEST_TIMEOUT_SECONDS, DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS, ServerConfig,
};
use crate::delegation::DelegationExchanger;
use crate::tools::{EchoToolHandler, ListTenantUsersHandler, ToolContext, ToolRegistry};
use crate::types::ConnectionId;

/// Type alias for HTTP request parts stored in rmcp extensions.
type HttpParts = http::request::Parts;

/// The auth context the middleware attached to the HTTP request behind this
/// protocol message.
fn request_auth(extensions: &Extensions) -> Option<AuthContext> {
    extensions
        .get::<HttpParts>()
        .and_then(|parts| AuthContext::from_extensions(&parts.extensions))
        .cloned()
}

/// MCP server that handles protocol requests and delegates to tool handlers.
///
/// One instance is created per transport session. In stateful mode it owns
/// the session's [`ConnectionLease`], so dropping the session clears the
/// connection's identity.
#[derive(Clone)]
pub struct McpServer {
    tool_registry: Arc<ToolRegistry>,
    /// Set in stateful mode only.
    connections: Option<ConnectionAuthStore>,
    connection_id: ConnectionId,
    lease: Arc<RwLock<Option<ConnectionLease>>>,
}

impl McpServer {
    /// Stateless server: every request carries its own identity.
    pub fn new(tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            tool_registry,
            connections: None,
            connection_id: ConnectionId::generate(),
            lease: Arc::new(RwLock::new(None)),
        }
    }

    /// Stateful server: identity is bound to the session at `initialize`.
    pub fn new_stateful(
        tool_registry: Arc<ToolRegistry>,
        connections: ConnectionAuthStore,
    ) -> Self {
        Self {
            connections: Some(connections),
            ..Self::new(tool_registry)
        }
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Record the session's identity (stateful mode only).
    async fn bind_connection(&self, extensions: &Extensions) -> Result<(), McpError> {
        let Some(store) = &self.connections else {
            return Ok(());
        };

        let Some(ctx) = request_auth(extensions) else {
            warn!(
                connection_id = %self.connection_id,
                "MCP session rejected: authentication required"
            );
            return Err(McpError::new(
                ErrorCode(-32001),
                "Authentication token required".to_string(),
                None,
            ));
        };

        info!(
            connection_id = %self.connection_id,
            subject = %ctx.subject(),
            "User authenticated for MCP session"
        );

        let mut slot = self.lease.write().await;
        match slot.as_ref() {
            Some(lease) => {
                if !lease.refresh(ctx) {
                    return Err(self.subject_mismatch(lease));
                }
            }
            None => *slot = Some(store.bind(self.connection_id.clone(), ctx)),
        }
        Ok(())
    }

    /// Identity for one protocol request.
    ///
    /// The context attached to the HTTP request wins. In stateful mode it must
    /// belong to the subject bound at `initialize`; it refreshes the stored
    /// context, which is the fallback for requests without one.
    async fn resolve_auth(
        &self,
        extensions: &Extensions,
    ) -> Result<Option<AuthContext>, McpError> {
        let from_request = request_auth(extensions);
        if self.connections.is_none() {
            return Ok(from_request);
        }

        let lease = self.lease.read().await;
        match (from_request, lease.as_ref()) {
            (Some(ctx), Some(lease)) => {
                if !lease.refresh(ctx.clone()) {
                    return Err(self.subject_mismatch(lease));
                }
                Ok(Some(ctx.with_connection(self.connection_id.clone())))
            }
            (Some(ctx), None) => Ok(Some(ctx)),
            (None, Some(lease)) => Ok(lease.context()),
            (None, None) => Ok(None),
        }
    }

    fn subject_mismatch(&self, lease: &ConnectionLease) -> McpError {
        warn!(
            connection_id = %self.connection_id,
            bound_subject = %lease.subject(),
            "MCP session rejected: token subject differs from session subject"
        );
        McpError::new(ErrorCode(-32003), "Invalid authentication token".to_string(), None)
    }
}

impl ServerHandler for McpServer {
    fn initialize(
        &self,
        _request: InitializeRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<InitializeResult, McpError>> + Send + '_ {
        async move {
            self.bind_connection(&context.extensions).await?;
            Ok(self.get_info())
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let result = ListToolsResult {
            tools: self.tool_registry.list_tools(),
            next_cursor: None,
            ..Default::default()
        };
        std::future::ready(Ok(result))
    }

    fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> impl Future<Output = Result<CallToolResult, McpError>> + Send + '_ {
        let tool_name = request.name.to_string();
        let args = request.arguments.unwrap_or_default();
        let registry = self.tool_registry.clone();

        async move {
            if !registry.contains(&tool_name) {
                return Err(McpError::invalid_params(
                    format!("Unknown tool: {}", tool_name),
                    None,
                ));
            }

            let ctx = ToolContext::new(self.resolve_auth(&context.extensions).await?);

            match registry.call_tool(&tool_name, args, &ctx).await {
                Ok(result) => Ok(result),
                Err(e) => {
                    error!(tool = %tool_name, "Tool execution failed: {:#}", e);
                    Err(McpError::internal_error(
                        format!("Tool execution failed: {}", e),
                        None,
                    ))
                }
            }
        }
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_06_18,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "MCP server that authenticates callers with Entra ID bearer tokens and calls \
                 protected backend APIs on their behalf."
                    .to_string(),
            ),
        }
    }
}

/// Shared, long-lived pieces of a running server.
#[derive(Clone)]
pub struct AppState {
    validator: Arc<TokenValidator>,
    tool_registry: Arc<ToolRegistry>,
    connections: ConnectionAuthStore,
    stateful: bool,
    session_idle_timeout: Duration,
    request_timeout: Duration,
}

impl AppState {
    pub fn new(validator: Arc<TokenValidator>, tool_registry: Arc<ToolRegistry>) -> Self {
        Self {
            validator,
            tool_registry,
            connections: ConnectionAuthStore::new(),
            stateful: false,
            session_idle_timeout: Duration::from_secs(DEFAULT_SESSION_IDLE_TIMEOUT_SECONDS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECONDS),
        }
    }

    /// Build the validator, key cache, delegation exchanger and tool set.
    pub fn from_config(config: &ServerConfig) -> Self {
        let http = reqwest::Client::new();

        let keys = Arc::new(KeySetCache::new(config.key_set.clone(), http.clone()));
        let validator = Arc::new(TokenValidator::new(config.validator.clone(), keys));

        let mut registry = ToolRegistry::new().register_handler(EchoToolHandler);
        match &config.delegation {
            Some(delegation) => {
                let mut exchanger = DelegationExchanger::new(delegation.clone(), http.clone());
                if let Some(margin) = config.delegation_cache_margin {
                    exchanger = exchanger.with_cache(margin);
                }
                registry = registry.register_handler(ListTenantUsersHandler::new(
                    Arc::new(exchanger),
                    config.backend_url.clone(),
                    config.backend_scopes.clone(),
                    http,
                ));
            }
            None => info!("Delegation credentials not configured; list_tenant_users disabled"),
        }

        Self {
            stateful: config.stateful,
            session_idle_timeout: config.session_idle_timeout,
            request_timeout: config.request_timeout,
            ..Self::new(validator, Arc::new(registry))
        }
    }

    pub fn connections(&self) -> &ConnectionAuthStore {
        &self.connections
    }

    pub fn tool_registry(&self) -> &Arc<ToolRegistry> {
        &self.tool_registry
    }

    /// `/mcp` behind token validation, `/health` open.
    pub fn router(&self) -> Router {
        let registry = self.tool_registry.clone();
        let connections = self.stateful.then(|| self.connections.clone());

        // Idle sessions end, which drops their server and its connection lease.
        let mut sessions = LocalSessionManager::default();
        sessions.session_config.keep_alive = Some(self.session_idle_timeout);

        let service = StreamableHttpService::new(
            move || {
                Ok(match &connections {
                    Some(store) => McpServer::new_stateful(registry.clone(), store.clone()),
                    None => McpServer::new(registry.clone()),
                })
            },
            sessions.into(),
            StreamableHttpServerConfig {
                stateful_mode: self.stateful,
                ..Default::default()
            },
        );

        let mcp = protect(
            Router::new().nest_service("/mcp", service),
            self.validator.clone(),
        );

        with_http_layers(
            Router::new().route("/health", get(health)).merge(mcp),
            self.request_timeout,
        )
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Request timeout, panic recovery, CORS and tracing.
///
/// CORS sits outside the token check so browser preflights are answered
/// without credentials.
fn with_http_layers(router: Router, request_timeout: Duration) -> Router {
    router
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!(panic = detail, "Request handler panicked");
    RpcErrorResponse::internal_error().into_response()
}

/// Start the server as an MCP Streamable HTTP endpoint.
///
/// Exposes `/mcp` (authenticated) and `/health` on `config.bind`, e.g.
/// `0.0.0.0:3000`, and serves until the process ends.
pub async fn start_mcp_http(config: ServerConfig) -> Result<()> {
    config.validate()?;

    let state = AppState::from_config(&config);
    let router = state.router();
    let listener = tokio::net::TcpListener::bind(&config.bind).await?;

    info!(
        bind = %config.bind,
        stateful = config.stateful,
        issuers = config.validator.trusted_issuers.len(),
        tools = state.tool_registry().len(),
        "MCP server running on http://{}/mcp",
        config.bind
    );

    axum::serve(listener, router).await?;

    Ok(())
}
