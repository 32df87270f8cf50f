//! Message dispatch: classification-driven routing, the initialization
//! gate, in-flight request tracking with cooperative cancellation, and the
//! conversion of handler failures into wire errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{McpError, McpResult};
use crate::handler::{HandlerContext, MessageHandler, SecurityGate};
use crate::outbound::OutboundRegistry;
use crate::registry::Registry;
use crate::session::Session;
use crate::wire::{self, Message, Notification, Request, RequestId};

/// Upper bound on concurrently executing request handlers.
pub const MAX_CONCURRENT_HANDLERS: usize = 64;

const CANCEL_METHODS: &[&str] = &["$/cancelRequest", "$/cancel", "notifications/cancelled"];

pub struct Dispatcher {
    name: String,
    version: String,
    protocol_version: String,
    registry: Arc<dyn Registry>,
    handler: Arc<dyn MessageHandler>,
    gate: Option<Arc<dyn SecurityGate>>,
    outbound: Arc<OutboundRegistry>,
    inflight: Mutex<HashMap<RequestId, CancellationToken>>,
    limiter: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        config: &ServerConfig,
        registry: Arc<dyn Registry>,
        handler: Arc<dyn MessageHandler>,
        outbound: Arc<OutboundRegistry>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            version: config.version.clone(),
            protocol_version: config.protocol_version.clone(),
            registry,
            handler,
            gate: None,
            outbound,
            inflight: Mutex::new(HashMap::new()),
            limiter: Arc::new(Semaphore::new(MAX_CONCURRENT_HANDLERS)),
        }
    }

    pub fn with_security_gate(mut self, gate: Arc<dyn SecurityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn outbound(&self) -> &Arc<OutboundRegistry> {
        &self.outbound
    }

    /// Route one decoded message. Requests yield a ready-to-write response
    /// frame; notifications and response frames yield nothing.
    pub async fn dispatch(&self, message: Message, session: &Arc<Session>) -> Option<Value> {
        session.touch();
        match message {
            Message::Response(response) => {
                self.outbound.deliver(&response);
                None
            }
            Message::Notification(notification) => {
                self.dispatch_notification(notification, session).await;
                None
            }
            Message::Request(request) => Some(self.dispatch_request(request, session).await),
        }
    }

    async fn dispatch_request(&self, request: Request, session: &Arc<Session>) -> Value {
        let id = request.id.clone();
        match self.try_request(request, session).await {
            Ok(result) => wire::response_frame(&id, result),
            Err(e) => wire::error_frame(Some(&id), &e.with_request_id(id.clone())),
        }
    }

    async fn try_request(&self, request: Request, session: &Arc<Session>) -> McpResult<Value> {
        if let Some(gate) = &self.gate {
            gate.authorize(&request.method, &session.context())?;
        }

        if request.method == "initialize" {
            return self.handle_initialize(request, session).await;
        }

        // The initialization gate: only ping is answered before the client's
        // `initialized` notification lands.
        if !session.is_initialized() && request.method != "ping" {
            return Err(McpError::initialization("Server not initialized"));
        }

        let token = CancellationToken::new();
        self.inflight
            .lock()
            .expect("in-flight map lock poisoned")
            .insert(request.id.clone(), token.clone());

        let permit = self
            .limiter
            .clone()
            .acquire_owned()
            .await
            .expect("handler limiter closed");

        let handler = self.handler.clone();
        let ctx = HandlerContext {
            session: session.clone(),
            request_context: session.context(),
            cancel: token,
        };
        let method = request.method.clone();
        let params = request.params.clone();
        // Run the handler on its own task so a panic is contained and can be
        // sanitized instead of tearing down the transport.
        let outcome = tokio::spawn(async move {
            let _permit = permit;
            handler.handle_request(&method, params, &ctx).await
        })
        .await;

        self.inflight
            .lock()
            .expect("in-flight map lock poisoned")
            .remove(&request.id);

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(e),
            Err(join_err) => {
                error!(
                    method = %request.method,
                    request_id = %request.id,
                    error = %join_err,
                    "request handler failed"
                );
                Err(McpError::internal_sanitized(&request.method))
            }
        }
    }

    async fn handle_initialize(
        &self,
        request: Request,
        session: &Arc<Session>,
    ) -> McpResult<Value> {
        if session.is_initialized() {
            return Err(McpError::invalid_request("server already initialized"));
        }

        let params = match request.params {
            None => json!({}),
            Some(Value::Object(map)) => Value::Object(map),
            Some(_) => {
                session.mark_failed();
                return Err(McpError::invalid_params("initialize params must be an object"));
            }
        };

        if let Some(requested) = params.get("protocolVersion").and_then(|v| v.as_str())
            && requested != self.protocol_version
        {
            warn!(
                requested,
                negotiated = %self.protocol_version,
                "client requested a different protocol version"
            );
        }

        session.begin_initialize(
            self.protocol_version.clone(),
            params.get("capabilities").cloned(),
        );
        info!(session_id = %session.id, "session initializing");

        Ok(json!({
            "protocolVersion": self.protocol_version,
            "capabilities": self.capabilities().await,
            "serverInfo": {
                "name": self.name,
                "version": self.version,
            },
        }))
    }

    /// Advertise only the capability kinds that have registrations. The
    /// prompts/roots `listChanged` flags report registrations not yet seen
    /// by a `*/list` request; tools and resources stay `false`.
    async fn capabilities(&self) -> Value {
        let mut caps = serde_json::Map::new();
        if !self.registry.list_tools().await.is_empty() {
            caps.insert("tools".to_string(), json!({ "listChanged": false }));
        }
        if !self.registry.list_resources().await.is_empty() {
            caps.insert("resources".to_string(), json!({ "listChanged": false }));
        }
        if !self.registry.list_prompts().await.is_empty() {
            caps.insert(
                "prompts".to_string(),
                json!({ "listChanged": self.registry.prompts_dirty() }),
            );
        }
        if !self.registry.list_roots().await.is_empty() {
            caps.insert(
                "roots".to_string(),
                json!({ "listChanged": self.registry.roots_dirty() }),
            );
        }
        caps.insert("sampling".to_string(), json!({}));
        Value::Object(caps)
    }

    async fn dispatch_notification(&self, notification: Notification, session: &Arc<Session>) {
        let method = notification.method.as_str();

        if method == "initialized" || method == "notifications/initialized" {
            session.mark_initialized();
            info!(session_id = %session.id, "session initialized");
            return;
        }

        if CANCEL_METHODS.contains(&method) {
            self.cancel_request(notification.params.as_ref());
            return;
        }

        if !session.is_initialized() {
            warn!(method, session_id = %session.id, "notification before initialization dropped");
            return;
        }

        let ctx = HandlerContext {
            session: session.clone(),
            request_context: session.context(),
            cancel: CancellationToken::new(),
        };
        // Notifications have no reply channel: failures are logged, never
        // surfaced to the peer.
        if let Err(e) = self
            .handler
            .handle_notification(method, notification.params, &ctx)
            .await
        {
            error!(method, error = %e, "notification handler failed");
        }
    }

    /// Signal the cancel token of an in-flight request. Ids that are not in
    /// flight are ignored; cancellation is advisory.
    fn cancel_request(&self, params: Option<&Value>) {
        let id = params.and_then(|p| {
            p.get("requestId")
                .or_else(|| p.get("id"))
                .and_then(parse_cancel_id)
        });
        let Some(id) = id else {
            debug!("cancellation notification without a usable id");
            return;
        };
        let token = {
            let inflight = self.inflight.lock().expect("in-flight map lock poisoned");
            inflight.get(&id).cloned()
        };
        match token {
            Some(token) => {
                info!(request_id = %id, "cancelling in-flight request");
                token.cancel();
            }
            None => debug!(request_id = %id, "cancellation for unknown request ignored"),
        }
    }

    pub fn inflight_count(&self) -> usize {
        self.inflight
            .lock()
            .expect("in-flight map lock poisoned")
            .len()
    }
}

fn parse_cancel_id(v: &Value) -> Option<RequestId> {
    match v {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}
