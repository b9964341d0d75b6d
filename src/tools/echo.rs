//! Handler for the `echo` tool.

use std::future::Future;
use std::pin::Pin;

use rmcp::model::{CallToolResult, Content, JsonObject};
use serde_json::json;

use crate::tools::{ToolContext, ToolHandler};

/// Echoes the `message` argument back. Needs no downstream access.
pub struct EchoToolHandler;

impl ToolHandler for EchoToolHandler {
    fn name(&self) -> &str {
        "echo"
    }

    fn title(&self) -> Option<&str> {
        Some("Echo Tool")
    }

    fn description(&self) -> &str {
        "Echoes back the provided message"
    }

    fn input_schema(&self) -> JsonObject {
        let mut schema = JsonObject::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert(
            "properties".to_string(),
            json!({
                "message": {
                    "type": "string",
                    "description": "Text to echo back."
                }
            }),
        );
        schema.insert("required".to_string(), json!(["message"]));
        schema
    }

    fn output_schema(&self) -> Option<JsonObject> {
        let mut schema = JsonObject::new();
        schema.insert("type".to_string(), json!("object"));
        schema.insert(
            "properties".to_string(),
            json!({ "echo": { "type": "string" } }),
        );
        schema.insert("required".to_string(), json!(["echo"]));
        Some(schema)
    }

    fn execute(
        &self,
        args: JsonObject,
        _ctx: &ToolContext,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<CallToolResult>> + Send + '_>> {
        Box::pin(async move {
            let Some(message) = args.get("message").and_then(|v| v.as_str()) else {
                return Ok(CallToolResult {
                    content: vec![Content::text("Missing required argument: message")],
                    structured_content: None,
                    is_error: Some(true),
                    meta: None,
                });
            };

            let output = json!({ "echo": format!("Tool echo (with your voice): {}", message) });
            Ok(CallToolResult {
                content: vec![Content::text(output.to_string())],
                structured_content: Some(output),
                is_error: Some(false),
                meta: None,
            })
        })
    }
}
