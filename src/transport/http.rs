//! Streamable HTTP transport: one endpoint where POST carries client
//! frames, GET opens a resumable SSE stream, and DELETE terminates the
//! session named by the `Mcp-Session-Id` header.

use std::convert::Infallible;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::header::HeaderValue;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::get;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::error::{McpError, McpResult};
use crate::events::EventStore;
use crate::session::{RequestContext, Session, SessionManager};
use crate::transport::OutboundChannel;
use crate::transport::sse::{header_map, header_str};
use crate::wire::{self, Message};

pub const MCP_SESSION_HEADER: &str = "mcp-session-id";
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

const STREAM_DEPTH: usize = 256;

#[derive(Clone)]
pub struct HttpState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub events: Arc<EventStore>,
    pub config: Arc<ServerConfig>,
}

pub fn router(state: HttpState) -> Router {
    let cors = if state.config.allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    };

    Router::new()
        .route("/", get(health))
        .route(
            &state.config.path_prefix,
            get(mcp_get).post(mcp_post).delete(mcp_delete),
        )
        .layer(cors)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Every frame pushed to an open GET stream goes through the event store
/// first, so a reconnecting client can replay it by id.
struct StreamingChannel {
    tx: mpsc::Sender<Event>,
    events: Arc<EventStore>,
    last_activity: Mutex<Instant>,
}

impl StreamingChannel {
    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("stream activity lock poisoned")
            .elapsed()
    }

    fn mark_active(&self) {
        *self
            .last_activity
            .lock()
            .expect("stream activity lock poisoned") = Instant::now();
    }
}

#[async_trait]
impl OutboundChannel for StreamingChannel {
    async fn deliver(&self, frame: Value) -> McpResult<()> {
        let data = frame.to_string();
        let id = self.events.append("message", data.clone());
        self.mark_active();
        self.tx
            .send(Event::default().id(id).event("message").data(data))
            .await
            .map_err(|_| McpError::TransportClosed)
    }
}

/// Detaches the streaming channel when the GET stream closes. The session
/// itself survives; only DELETE (or expiry) removes it.
struct StreamGuard {
    session: Arc<Session>,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        debug!(session_id = %self.session.id, "event stream closed");
        self.heartbeat.abort();
        self.session.detach_channel();
    }
}

fn origin_denied(state: &HttpState, headers: &HeaderMap) -> Option<HttpResponse> {
    let origin = headers.get("origin").and_then(|v| v.to_str().ok());
    if state.config.origin_allowed(origin) {
        return None;
    }
    warn!(origin = ?origin, "request denied by origin allow-list");
    Some((StatusCode::FORBIDDEN, "Origin not allowed").into_response())
}

fn session_header(id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(id) {
        headers.insert(MCP_SESSION_HEADER, value);
    }
    headers
}

async fn mcp_post(
    State(state): State<HttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    if let Some(denied) = origin_denied(&state, &headers) {
        return denied;
    }
    let session_hint = header_str(&headers, MCP_SESSION_HEADER);

    let raw = match std::str::from_utf8(&body) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => {
            let err = McpError::parse(None);
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(wire::error_frame(None, &err)),
            )
                .into_response();
        }
    };

    let message = match wire::decode(raw) {
        Ok(message) => message,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(wire::error_frame(None, &e)),
            )
                .into_response();
        }
    };

    // A response frame answers a server-initiated request; nothing is owed
    // to the caller beyond acceptance.
    let message = match message {
        Message::Response(response) => {
            if let Some(id) = &session_hint
                && let Some(session) = state.sessions.get(id)
            {
                session.touch();
            }
            state.dispatcher.outbound().deliver(&response);
            let echo = session_hint.as_deref().map(session_header).unwrap_or_default();
            return (StatusCode::ACCEPTED, echo).into_response();
        }
        other => other,
    };

    let context = RequestContext::for_transport("streamable-http")
        .with_request("POST", &state.config.path_prefix)
        .with_headers(header_map(&headers));
    let session = state.sessions.get_or_create(session_hint.as_deref(), context);
    session.set_user_agent(header_str(&headers, "user-agent"));
    session.set_remote_addr(header_str(&headers, "x-forwarded-for"));

    let is_request = matches!(message, Message::Request(_));
    let outcome = state.dispatcher.dispatch(message, &session).await;
    let echo = session_header(&session.id);

    match outcome {
        Some(frame) => (StatusCode::OK, echo, axum::Json(frame)).into_response(),
        None if is_request => {
            // Defensive: a request always yields a frame.
            (StatusCode::OK, echo).into_response()
        }
        None => (StatusCode::ACCEPTED, echo).into_response(),
    }
}

async fn mcp_get(State(state): State<HttpState>, headers: HeaderMap) -> HttpResponse {
    if let Some(denied) = origin_denied(&state, &headers) {
        return denied;
    }
    let Some(session_id) = header_str(&headers, MCP_SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    let Some(session) = state.sessions.get(&session_id) else {
        return (StatusCode::NOT_FOUND, "Unknown session").into_response();
    };
    session.touch();

    let (tx, rx) = mpsc::channel(STREAM_DEPTH);
    let channel = Arc::new(StreamingChannel {
        tx,
        events: state.events.clone(),
        last_activity: Mutex::new(Instant::now()),
    });
    session.attach_channel(channel.clone());
    info!(session_id = %session.id, "event stream opened");

    let mut initial = Vec::new();
    let established = wire::notification_frame(
        "connection/established",
        Some(json!({
            "sessionId": session.id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
    );
    initial.push(Event::default().event("message").data(established.to_string()));

    if let Some(last_id) = header_str(&headers, "last-event-id") {
        let replayed = state.events.replay_after(&last_id);
        debug!(session_id = %session.id, last_id, count = replayed.len(), "replaying events");
        for event in replayed {
            initial.push(
                Event::default()
                    .id(event.id)
                    .event(event.event_type)
                    .data(event.data),
            );
        }
    }

    let heartbeat = tokio::spawn(heartbeat_loop(channel.clone()));
    let guard = StreamGuard {
        session: session.clone(),
        heartbeat,
    };
    let stream = tokio_stream::iter(initial)
        .chain(ReceiverStream::new(rx))
        .map(move |event| {
            let _alive = &guard;
            Ok::<Event, Infallible>(event)
        });

    let mut headers = HeaderMap::new();
    headers.insert("cache-control", HeaderValue::from_static("no-cache"));
    headers.insert("connection", HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    (
        headers,
        Sse::new(stream).keep_alive(KeepAlive::default()),
    )
        .into_response()
}

/// Emit a heartbeat after 30 idle seconds; it is stored like any other
/// event so resumption sees a gapless id sequence.
async fn heartbeat_loop(channel: Arc<StreamingChannel>) {
    loop {
        tokio::time::sleep(HEARTBEAT_INTERVAL / 2).await;
        if channel.idle_for() < HEARTBEAT_INTERVAL {
            continue;
        }
        let frame = wire::notification_frame(
            "heartbeat",
            Some(json!({ "timestamp": chrono::Utc::now().to_rfc3339() })),
        );
        if channel.deliver(frame).await.is_err() {
            break;
        }
    }
}

async fn mcp_delete(State(state): State<HttpState>, headers: HeaderMap) -> HttpResponse {
    if let Some(denied) = origin_denied(&state, &headers) {
        return denied;
    }
    let Some(session_id) = header_str(&headers, MCP_SESSION_HEADER) else {
        return (StatusCode::BAD_REQUEST, "Missing Mcp-Session-Id header").into_response();
    };
    if state.sessions.terminate(&session_id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::NOT_FOUND, "Unknown session").into_response()
    }
}
