//! Legacy SSE transport: a GET stream whose first event names the paired
//! POST endpoint, and a per-connection FIFO queue that carries every frame
//! the server sends back.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::body::Bytes;
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use crate::dispatch::Dispatcher;
use crate::error::{McpError, McpResult};
use crate::session::{RequestContext, SessionManager};
use crate::transport::OutboundChannel;
use crate::wire::{self, Message};

const QUEUE_DEPTH: usize = 256;

#[derive(Clone)]
pub struct SseState {
    pub dispatcher: Arc<Dispatcher>,
    pub sessions: Arc<SessionManager>,
    pub prefix: String,
}

pub fn router(state: SseState) -> Router {
    Router::new()
        .route(&format!("{}/sse", state.prefix), get(open_stream))
        .route(&format!("{}/message", state.prefix), post(post_message))
        .with_state(state)
}

/// The per-connection outbound queue. Frames are enqueued FIFO and written
/// by the connection's streaming task.
struct SseQueue {
    tx: mpsc::Sender<Value>,
}

#[async_trait]
impl OutboundChannel for SseQueue {
    async fn deliver(&self, frame: Value) -> McpResult<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| McpError::TransportClosed)
    }
}

/// Dropping the stream tears the session down; the legacy transport has no
/// other termination signal.
struct StreamGuard {
    sessions: Arc<SessionManager>,
    session_id: String,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        debug!(session_id = %self.session_id, "SSE stream closed");
        self.sessions.terminate(&self.session_id);
    }
}

async fn open_stream(State(state): State<SseState>, headers: HeaderMap) -> impl IntoResponse {
    let context = RequestContext::for_transport("sse")
        .with_request("GET", &format!("{}/sse", state.prefix))
        .with_headers(header_map(&headers));
    let session = state.sessions.get_or_create(None, context);
    session.set_user_agent(header_str(&headers, "user-agent"));
    session.set_remote_addr(header_str(&headers, "x-forwarded-for"));

    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    session.attach_channel(Arc::new(SseQueue { tx }));
    info!(session_id = %session.id, "SSE stream opened");

    let post_url = format!("{}/message?session_id={}", state.prefix, session.id);
    let endpoint = tokio_stream::iter(vec![Ok::<Event, Infallible>(
        Event::default().event("endpoint").data(post_url),
    )]);

    let guard = StreamGuard {
        sessions: state.sessions.clone(),
        session_id: session.id.clone(),
    };
    let frames = ReceiverStream::new(rx).map(move |frame: Value| {
        let _alive = &guard;
        Ok::<Event, Infallible>(Event::default().event("message").data(frame.to_string()))
    });

    Sse::new(endpoint.chain(frames)).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct MessageQuery {
    session_id: Option<String>,
}

async fn post_message(
    State(state): State<SseState>,
    Query(query): Query<MessageQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let session = query
        .session_id
        .as_deref()
        .and_then(|id| state.sessions.get(id));
    let Some(session) = session else {
        warn!(session_id = ?query.session_id, "POST for unknown SSE session");
        let err = McpError::not_found("session not found");
        return (
            StatusCode::NOT_FOUND,
            axum::Json(wire::error_frame(None, &err)),
        )
            .into_response();
    };

    session.touch();
    session.replace_context(
        RequestContext::for_transport("sse")
            .with_request("POST", &format!("{}/message", state.prefix))
            .with_headers(header_map(&headers))
            .with_query(HashMap::from([(
                "session_id".to_string(),
                session.id.clone(),
            )])),
    );

    let raw = match std::str::from_utf8(&body) {
        Ok(raw) => raw,
        Err(_) => {
            let err = McpError::parse(None);
            return (
                StatusCode::BAD_REQUEST,
                axum::Json(wire::error_frame(None, &err)),
            )
                .into_response();
        }
    };

    match wire::decode(raw) {
        Err(e) => (
            StatusCode::BAD_REQUEST,
            axum::Json(wire::error_frame(None, &e)),
        )
            .into_response(),
        // Accept immediately; a request's JSON-RPC response flows back over
        // the SSE stream once the handler completes. Notifications and
        // response frames are handled before the 202 so lifecycle signals
        // are ordered with respect to later POSTs.
        Ok(message @ Message::Request(_)) => {
            let dispatcher = state.dispatcher.clone();
            tokio::spawn(async move {
                if let Some(frame) = dispatcher.dispatch(message, &session).await
                    && let Err(e) = session.send_frame(frame).await
                {
                    warn!(session_id = %session.id, error = %e, "SSE response dropped");
                }
            });
            StatusCode::ACCEPTED.into_response()
        }
        Ok(message) => {
            state.dispatcher.dispatch(message, &session).await;
            StatusCode::ACCEPTED.into_response()
        }
    }
}

pub(crate) fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

pub(crate) fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}
