//! MCP server with Entra ID bearer-token authentication and on-behalf-of
//! access to downstream APIs.

// Core modules
pub mod api_client;
pub mod auth;
pub mod config;
pub mod delegation;
pub mod types;

// Protocol surface
pub mod server;
pub mod tools;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export key types and functions
pub use api_client::{ApiError, AuthenticatedClient};
pub use auth::{AuthContext, ConnectionAuthStore, KeySetCache, TokenValidator, VerifiedIdentity};
pub use config::{ConfigError, ServerConfig};
pub use delegation::{DelegationExchanger, OnBehalfOfCredential, TokenProvider};
pub use server::{AppState, McpServer, start_mcp_http};
pub use tools::{ToolHandler, ToolRegistry};
