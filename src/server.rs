//! The server facade: wires the registry, handler, dispatcher, outbound
//! registry, session manager, and event store together, and exposes the
//! transport entry points.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use serde_json::Value;
use tracing::info;

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::McpResult;
use crate::events::EventStore;
use crate::handler::{CoreHandler, MessageHandler, SecurityGate};
use crate::outbound::OutboundRegistry;
use crate::registry::Registry;
use crate::session::{Session, SessionManager};
use crate::transport::http::{self, HttpState};
use crate::transport::sse::{self, SseState};
use crate::transport::stdio::StdioTransport;
use crate::wire;

pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
    outbound: Arc<OutboundRegistry>,
    sessions: Arc<SessionManager>,
    events: Arc<EventStore>,
}

impl Server {
    /// A server answering the standard MCP method surface from `registry`.
    pub fn new(config: ServerConfig, registry: Arc<dyn Registry>) -> Self {
        let handler = Arc::new(CoreHandler::new(registry.clone()));
        Self::with_parts(config, registry, handler, None)
    }

    pub fn with_handler(
        config: ServerConfig,
        registry: Arc<dyn Registry>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::with_parts(config, registry, handler, None)
    }

    pub fn with_parts(
        config: ServerConfig,
        registry: Arc<dyn Registry>,
        handler: Arc<dyn MessageHandler>,
        gate: Option<Arc<dyn SecurityGate>>,
    ) -> Self {
        let outbound = Arc::new(OutboundRegistry::new(config.request_timeout));
        let mut dispatcher =
            Dispatcher::new(&config, registry, handler, outbound.clone());
        if let Some(gate) = gate {
            dispatcher = dispatcher.with_security_gate(gate);
        }
        let sessions = Arc::new(SessionManager::new("mcp", config.session_timeout));
        let events = Arc::new(EventStore::new(config.event_retention));
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            outbound,
            sessions,
            events,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn events(&self) -> &Arc<EventStore> {
        &self.events
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Serve stdin/stdout until EOF. The stdio session never expires, so no
    /// sweeper runs in this mode.
    pub async fn run_stdio(&self) -> anyhow::Result<()> {
        StdioTransport::new(self.dispatcher.clone(), self.sessions.clone())
            .run()
            .await
    }

    /// The combined HTTP application: streamable HTTP plus the legacy SSE
    /// pair, under one router so tests can drive it directly.
    pub fn app(&self) -> Router {
        let streamable = http::router(HttpState {
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            events: self.events.clone(),
            config: Arc::new(self.config.clone()),
        });
        let legacy = sse::router(SseState {
            dispatcher: self.dispatcher.clone(),
            sessions: self.sessions.clone(),
            prefix: self.config.path_prefix.clone(),
        });
        streamable.merge(legacy)
    }

    pub async fn serve_http(&self) -> anyhow::Result<()> {
        self.sessions.spawn_sweeper(self.config.sweep_interval);
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr()).await?;
        info!(addr = %self.config.listen_addr(), prefix = %self.config.path_prefix, "MCP server listening (http)");
        axum::serve(listener, self.app())
            .with_graceful_shutdown(async {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutdown signal received");
            })
            .await?;
        self.outbound.shutdown();
        Ok(())
    }

    /// Server-initiated request over whatever transport the session is
    /// attached to; blocks until the client responds or the timeout fires.
    pub async fn send_request(
        &self,
        session: &Session,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        self.outbound.send(session, method, params, timeout).await
    }

    pub async fn notify_tools_list_changed(&self) -> usize {
        self.notify_list_changed("tools").await
    }

    pub async fn notify_resources_list_changed(&self) -> usize {
        self.notify_list_changed("resources").await
    }

    pub async fn notify_prompts_list_changed(&self) -> usize {
        self.notify_list_changed("prompts").await
    }

    pub async fn notify_roots_list_changed(&self) -> usize {
        self.notify_list_changed("roots").await
    }

    async fn notify_list_changed(&self, kind: &str) -> usize {
        let frame =
            wire::notification_frame(&format!("notifications/{kind}/list_changed"), None);
        self.sessions.broadcast(&frame).await
    }
}
