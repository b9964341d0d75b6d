//! Tool handler registry for managing MCP tool implementations.
//!
//! This module provides a simple way to register and invoke tool handlers,
//! making it easy to add new tools without modifying the core `ServerHandler`
//! implementation.

mod registry;

pub use registry::{ToolContext, ToolHandler, ToolRegistry};

// Tool handler implementations
mod echo;
mod list_tenant_users;

pub use echo::EchoToolHandler;
pub use list_tenant_users::{ListTenantUsersHandler, USERS_PATH};
