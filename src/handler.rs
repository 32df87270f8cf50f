//! The message-handler seam between the dispatcher and the embedder, plus
//! the built-in method table serving the standard MCP request surface from
//! a [`Registry`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{McpError, McpResult};
use crate::registry::Registry;
use crate::session::{RequestContext, Session};

/// Per-dispatch context handed to the handler alongside the decoded method.
#[derive(Clone)]
pub struct HandlerContext {
    pub session: Arc<Session>,
    pub request_context: Arc<RequestContext>,
    pub cancel: CancellationToken,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &HandlerContext,
    ) -> McpResult<Value>;

    async fn handle_notification(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: &HandlerContext,
    ) -> McpResult<()>;
}

/// Optional synchronous authorization check, consulted before the handler.
pub trait SecurityGate: Send + Sync {
    fn authorize(&self, operation: &str, ctx: &RequestContext) -> McpResult<()>;
}

/// Serves `ping`, `tools/*`, `resources/*`, `prompts/*`, and `roots/list`
/// against the registry. Tool execution failures come back as `isError`
/// content rather than protocol errors; unknown names are `-32001`.
pub struct CoreHandler {
    registry: Arc<dyn Registry>,
}

impl CoreHandler {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }

    async fn tools_list(&self) -> Value {
        let tools: Vec<Value> = self
            .registry
            .list_tools()
            .await
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "inputSchema": t.input_schema,
                })
            })
            .collect();
        json!({ "tools": tools })
    }

    async fn tools_call(&self, params: Option<Value>) -> McpResult<Value> {
        let params = params.ok_or_else(|| McpError::invalid_params("missing params"))?;
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::invalid_params("tools/call missing 'name'"))?;
        let args = params
            .get("arguments")
            .cloned()
            .unwrap_or_else(|| json!({}));

        let tool = self
            .registry
            .lookup_tool(name)
            .await
            .ok_or_else(|| McpError::not_found(format!("tool '{name}'")))?;

        match (tool.handler)(args).await {
            Ok(value) => Ok(tool_result(value)),
            Err(e) => Ok(json!({
                "content": [{
                    "type": "text",
                    "text": json!({ "error": e.to_string(), "tool": name }).to_string(),
                }],
                "isError": true,
            })),
        }
    }

    async fn resources_list(&self) -> Value {
        let resources: Vec<Value> = self
            .registry
            .list_resources()
            .await
            .iter()
            .map(|r| {
                json!({
                    "uri": r.uri,
                    "name": r.name,
                    "description": r.description,
                    "mimeType": r.mime_type,
                })
            })
            .collect();
        json!({ "resources": resources })
    }

    async fn resources_read(&self, params: Option<Value>) -> McpResult<Value> {
        let params = params.ok_or_else(|| McpError::invalid_params("missing params"))?;
        let uri = params
            .get("uri")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::invalid_params("resources/read missing 'uri'"))?;

        let resource = self
            .registry
            .lookup_resource(uri)
            .await
            .ok_or_else(|| McpError::not_found(format!("resource '{uri}'")))?;
        let text = (resource.handler)(uri.to_string()).await?;
        Ok(json!({
            "contents": [{
                "uri": resource.uri,
                "mimeType": resource.mime_type,
                "text": text,
            }]
        }))
    }

    async fn prompts_list(&self) -> Value {
        let prompts: Vec<Value> = self
            .registry
            .list_prompts()
            .await
            .iter()
            .map(|p| json!({ "name": p.name, "description": p.description }))
            .collect();
        self.registry.clear_prompts_dirty();
        json!({ "prompts": prompts })
    }

    async fn prompts_get(&self, params: Option<Value>) -> McpResult<Value> {
        let params = params.ok_or_else(|| McpError::invalid_params("missing params"))?;
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| McpError::invalid_params("prompts/get missing 'name'"))?;
        let prompt = self
            .registry
            .lookup_prompt(name)
            .await
            .ok_or_else(|| McpError::not_found(format!("prompt '{name}'")))?;
        Ok(json!({
            "description": prompt.description,
            "messages": [{
                "role": "user",
                "content": { "type": "text", "text": prompt.content },
            }]
        }))
    }

    async fn roots_list(&self) -> Value {
        let roots: Vec<Value> = self
            .registry
            .list_roots()
            .await
            .iter()
            .map(|r| json!({ "uri": r.uri, "name": r.name }))
            .collect();
        self.registry.clear_roots_dirty();
        json!({ "roots": roots })
    }
}

/// Wrap a tool's return value into call-result content. Values that already
/// carry a `content` member pass through untouched.
fn tool_result(value: Value) -> Value {
    if value.get("content").is_some() {
        return value;
    }
    let text = match value {
        Value::String(s) => s,
        other => other.to_string(),
    };
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": false,
    })
}

#[async_trait]
impl MessageHandler for CoreHandler {
    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        _ctx: &HandlerContext,
    ) -> McpResult<Value> {
        match method {
            "ping" => Ok(json!({})),
            "tools/list" => Ok(self.tools_list().await),
            "tools/call" => self.tools_call(params).await,
            "resources/list" => Ok(self.resources_list().await),
            "resources/read" => self.resources_read(params).await,
            "prompts/list" => Ok(self.prompts_list().await),
            "prompts/get" => self.prompts_get(params).await,
            "roots/list" => Ok(self.roots_list().await),
            other => Err(McpError::method_not_found(other)),
        }
    }

    async fn handle_notification(
        &self,
        method: &str,
        _params: Option<Value>,
        _ctx: &HandlerContext,
    ) -> McpResult<()> {
        debug!(method, "notification ignored");
        Ok(())
    }
}
