//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use vecmcp::config::ServerConfig;
use vecmcp::error::{McpError, McpResult};
use vecmcp::registry::{InMemoryRegistry, PromptDef, ResourceDef, RootDef, ToolDef};
use vecmcp::server::Server;
use vecmcp::transport::OutboundChannel;

/// Registry with one of everything, enough to exercise the full request
/// surface.
pub async fn test_registry() -> Arc<InMemoryRegistry> {
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register_tool(ToolDef::new(
            "echo",
            "Echo the text argument",
            json!({
                "type": "object",
                "properties": { "text": { "type": "string" } },
                "required": ["text"],
            }),
            |args| async move {
                let text = args.get("text").and_then(|v| v.as_str()).unwrap_or("");
                Ok(Value::String(text.to_string()))
            },
        ))
        .await
        .unwrap();
    registry
        .register_tool(ToolDef::new(
            "explode",
            "Always fails",
            json!({"type": "object"}),
            |_| async move { Err(McpError::internal("deliberate failure")) },
        ))
        .await
        .unwrap();
    registry
        .register_prompt(PromptDef {
            name: "greet".to_string(),
            description: "A greeting prompt".to_string(),
            content: "Say hello.".to_string(),
        })
        .await
        .unwrap();
    registry
        .register_resource(ResourceDef::new(
            "mem://greeting",
            "greeting",
            "A canned greeting",
            "text/plain",
            |_| async move { Ok("hello".to_string()) },
        ))
        .await
        .unwrap();
    registry
        .register_root(RootDef {
            uri: "file:///workspace".to_string(),
            name: "workspace".to_string(),
        })
        .await
        .unwrap();
    registry
}

pub fn test_config() -> ServerConfig {
    ServerConfig {
        name: "vecmcp-test".to_string(),
        ..ServerConfig::default()
    }
}

pub async fn test_server() -> Server {
    Server::new(test_config(), test_registry().await)
}

pub async fn test_server_with(config: ServerConfig) -> Server {
    Server::new(config, test_registry().await)
}

pub fn initialize_body(id: i64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": { "name": "test-client", "version": "1.0.0" },
        },
    })
}

/// Outbound channel that hands delivered frames to the test over an mpsc
/// receiver, standing in for an open event stream.
pub struct PipeChannel {
    tx: mpsc::Sender<Value>,
}

impl PipeChannel {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Value>) {
        let (tx, rx) = mpsc::channel(16);
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl OutboundChannel for PipeChannel {
    async fn deliver(&self, frame: Value) -> McpResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| McpError::TransportClosed)
    }
}
