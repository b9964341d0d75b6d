//! Handler for the `list_tenant_users` tool.
//!
//! Lists the users of the caller's tenant through the backend API, using a
//! token obtained on behalf of the caller.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use rmcp::model::{CallToolResult, Content, JsonObject};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::api_client::{ApiError, AuthenticatedClient};
use crate::delegation::{DelegationExchanger, OnBehalfOfCredential};
use crate::tools::{ToolContext, ToolHandler};
use crate::types::ScopeSet;

/// Backend path listing the tenant's users.
pub const USERS_PATH: &str = "/v1.0/users";

/// Handler for the `list_tenant_users` tool.
pub struct ListTenantUsersHandler {
    exchanger: Arc<DelegationExchanger>,
    backend_url: String,
    backend_scopes: ScopeSet,
    http: reqwest::Client,
}

impl ListTenantUsersHandler {
    pub fn new(
        exchanger: Arc<DelegationExchanger>,
        backend_url: impl Into<String>,
        backend_scopes: ScopeSet,
        http: reqwest::Client,
    ) -> Self {
        Self {
            exchanger,
            backend_url: backend_url.into(),
            backend_scopes,
            http,
        }
    }
}

/// Which step of the call chain failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Authentication,
    Delegation,
    Downstream,
}

impl Stage {
    fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::Delegation => "delegation",
            Self::Downstream => "downstream",
        }
    }
}

fn failure(stage: Stage, message: String, status: Option<u16>) -> CallToolResult {
    let output = json!({
        "result": "API call failed",
        "authenticated": false,
        "stage": stage.as_str(),
        "status": status,
        "error": message,
    });
    CallToolResult {
        content: vec![Content::text(format!("Error: {}", message))],
        structured_content: Some(output),
        is_error: Some(true),
        meta: None,
    }
}

impl ToolHandler for ListTenantUsersHandler {
    fn name(&self) -> &str {
        "list_tenant_users"
    }

    fn title(&self) -> Option<&str> {
        Some("List the users in the caller's tenant")
    }

    fn description(&self) -> &str {
        "Calls a secured backend API with a token obtained on behalf of the caller. \
         The response contains a list of all users in the caller's tenant."
    }

    fn input_schema(&self) -> JsonObject {
        let mut schema = JsonObject::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert(
            "properties".to_string(),
            json!({
                "companyName": {
                    "type": "string",
                    "description": "The company name associated with the tenant"
                }
            }),
        );
        schema.insert("required".to_string(), json!([]));
        schema
    }

    fn output_schema(&self) -> Option<JsonObject> {
        let mut schema = JsonObject::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert(
            "properties".to_string(),
            json!({
                "result": { "type": "string" },
                "authenticated": { "type": "boolean" },
                "userData": {}
            }),
        );
        schema.insert("required".to_string(), json!(["result", "authenticated"]));
        Some(schema)
    }

    fn execute(
        &self,
        args: JsonObject,
        ctx: &ToolContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CallToolResult>> + Send + '_>> {
        let auth = ctx.auth.clone();

        Box::pin(async move {
            let Some(auth) = auth else {
                warn!("list_tenant_users called without an authenticated caller");
                return Ok(failure(
                    Stage::Authentication,
                    "No authenticated user for this request".to_string(),
                    None,
                ));
            };

            let company = args
                .get("companyName")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();

            let credential =
                OnBehalfOfCredential::new(self.exchanger.clone(), auth.identity().clone());
            let client = AuthenticatedClient::new(
                self.backend_url.clone(),
                Arc::new(credential),
                self.backend_scopes.clone(),
                self.http.clone(),
            );

            let response: Value = match client.get(USERS_PATH).await {
                Ok(response) => response,
                Err(ApiError::Token(e)) => {
                    warn!(subject = %auth.subject(), "Delegation failed: {}", e);
                    return Ok(failure(Stage::Delegation, e.to_string(), None));
                }
                Err(e) => {
                    warn!(subject = %auth.subject(), "Backend call failed: {}", e);
                    return Ok(failure(Stage::Downstream, e.to_string(), e.status()));
                }
            };

            let users = response.get("value").cloned().unwrap_or(Value::Null);
            info!(
                subject = %auth.subject(),
                count = users.as_array().map_or(0, Vec::len),
                "Listed tenant users"
            );

            let output = json!({
                "result": format!(
                    "Secured API call processed message: \"{}\" with data: {}",
                    company, users
                ),
                "authenticated": true,
                "userData": users,
            });
            let text = serde_json::to_string_pretty(&output)?;

            Ok(CallToolResult {
                content: vec![Content::text(text)],
                structured_content: Some(output),
                is_error: Some(false),
                meta: None,
            })
        })
    }
}
