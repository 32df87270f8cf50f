//! Per-peer session state and the session manager: creation, touch,
//! expiration sweep, termination, and broadcast delivery.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{McpError, McpResult};
use crate::transport::OutboundChannel;

/// The single implicit session id used by the stdio transport. Its lifetime
/// is the process's; it is never terminable.
pub const STDIO_SESSION_ID: &str = "stdio-global";

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Immutable snapshot of the inbound request that carried a message.
/// Replaced wholesale on every inbound message, never mutated in place.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub transport: String,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
}

impl RequestContext {
    pub fn for_transport(transport: &str) -> Self {
        Self {
            transport: transport.to_string(),
            ..Self::default()
        }
    }

    pub fn with_request(mut self, method: &str, path: &str) -> Self {
        self.method = method.to_string();
        self.path = path.to_string();
        self
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Pending,
    AwaitingInitialized,
    Initialized,
    Failed,
}

pub struct Session {
    pub id: String,
    created_at: Instant,
    last_accessed: RwLock<Instant>,
    state: RwLock<InitState>,
    protocol_version: RwLock<Option<String>>,
    client_capabilities: RwLock<Option<Value>>,
    context: RwLock<Arc<RequestContext>>,
    channel: RwLock<Option<Arc<dyn OutboundChannel>>>,
    remote_addr: RwLock<Option<String>>,
    user_agent: RwLock<Option<String>>,
}

impl Session {
    fn new(id: String, context: RequestContext) -> Self {
        let now = Instant::now();
        Self {
            id,
            created_at: now,
            last_accessed: RwLock::new(now),
            state: RwLock::new(InitState::Pending),
            protocol_version: RwLock::new(None),
            client_capabilities: RwLock::new(None),
            context: RwLock::new(Arc::new(context)),
            channel: RwLock::new(None),
            remote_addr: RwLock::new(None),
            user_agent: RwLock::new(None),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn touch(&self) {
        *self.last_accessed.write().expect("session lock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_accessed
            .read()
            .expect("session lock poisoned")
            .elapsed()
    }

    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    pub fn state(&self) -> InitState {
        *self.state.read().expect("session lock poisoned")
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == InitState::Initialized
    }

    /// Record the negotiated version and client capabilities. Both are fixed
    /// for the session's lifetime once set; a second `initialize` is rejected
    /// upstream by the dispatcher.
    pub fn begin_initialize(&self, protocol_version: String, capabilities: Option<Value>) {
        *self
            .protocol_version
            .write()
            .expect("session lock poisoned") = Some(protocol_version);
        *self
            .client_capabilities
            .write()
            .expect("session lock poisoned") = capabilities;
        let mut state = self.state.write().expect("session lock poisoned");
        if *state == InitState::Pending {
            *state = InitState::AwaitingInitialized;
        }
    }

    pub fn mark_initialized(&self) {
        *self.state.write().expect("session lock poisoned") = InitState::Initialized;
    }

    pub fn mark_failed(&self) {
        *self.state.write().expect("session lock poisoned") = InitState::Failed;
    }

    pub fn protocol_version(&self) -> Option<String> {
        self.protocol_version
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    pub fn client_capabilities(&self) -> Option<Value> {
        self.client_capabilities
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    pub fn context(&self) -> Arc<RequestContext> {
        self.context.read().expect("session lock poisoned").clone()
    }

    /// Install the latest inbound request snapshot.
    pub fn replace_context(&self, context: RequestContext) {
        *self.context.write().expect("session lock poisoned") = Arc::new(context);
    }

    pub fn set_remote_addr(&self, addr: Option<String>) {
        *self.remote_addr.write().expect("session lock poisoned") = addr;
    }

    pub fn remote_addr(&self) -> Option<String> {
        self.remote_addr
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    pub fn set_user_agent(&self, agent: Option<String>) {
        *self.user_agent.write().expect("session lock poisoned") = agent;
    }

    pub fn user_agent(&self) -> Option<String> {
        self.user_agent
            .read()
            .expect("session lock poisoned")
            .clone()
    }

    pub fn attach_channel(&self, channel: Arc<dyn OutboundChannel>) {
        *self.channel.write().expect("session lock poisoned") = Some(channel);
    }

    pub fn detach_channel(&self) {
        *self.channel.write().expect("session lock poisoned") = None;
    }

    pub fn channel(&self) -> Option<Arc<dyn OutboundChannel>> {
        self.channel.read().expect("session lock poisoned").clone()
    }

    pub fn has_channel(&self) -> bool {
        self.channel
            .read()
            .expect("session lock poisoned")
            .is_some()
    }

    /// Deliver one frame over the session's channel, refusing when there is
    /// no writable channel. Every outbound send counts as activity.
    pub async fn send_frame(&self, frame: Value) -> McpResult<()> {
        let Some(channel) = self.channel() else {
            return Err(McpError::TransportClosed);
        };
        self.touch();
        channel.deliver(frame).await
    }
}

pub struct SessionManager {
    transport: String,
    timeout: Duration,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(transport: &str, timeout: Duration) -> Self {
        Self {
            transport: transport.to_string(),
            timeout,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Reuse an unexpired session (touching it and replacing its request
    /// context), or create a new one. An expired session is unreachable: a
    /// message carrying its id gets a fresh session under the same id.
    pub fn get_or_create(&self, id: Option<&str>, context: RequestContext) -> Arc<Session> {
        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        if let Some(id) = id {
            match sessions.get(id) {
                Some(existing) if !existing.is_expired(self.timeout) => {
                    existing.touch();
                    existing.replace_context(context);
                    return existing.clone();
                }
                Some(_) => {
                    debug!(session_id = %id, "session expired, replacing");
                    sessions.remove(id);
                }
                None => {}
            }
        }

        let id = id
            .map(|s| s.to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let session = Arc::new(Session::new(id.clone(), context));
        sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, transport = %self.transport, "session created");
        session
    }

    /// Fetch an unexpired session without creating one.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().expect("session map lock poisoned");
        sessions
            .get(id)
            .filter(|s| !s.is_expired(self.timeout))
            .cloned()
    }

    /// Remove a session. The stdio session is bound to the process and is
    /// never terminable.
    pub fn terminate(&self, id: &str) -> bool {
        if id == STDIO_SESSION_ID {
            return false;
        }
        let removed = self
            .sessions
            .write()
            .expect("session map lock poisoned")
            .remove(id);
        match removed {
            Some(session) => {
                session.detach_channel();
                info!(session_id = %id, "session terminated");
                true
            }
            None => false,
        }
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .len()
    }

    /// Drop every expired session, detaching any streaming connection.
    /// The stdio session never expires.
    pub fn sweep(&self) -> usize {
        let mut sessions = self.sessions.write().expect("session map lock poisoned");
        let before = sessions.len();
        sessions.retain(|id, session| {
            if id == STDIO_SESSION_ID || !session.is_expired(self.timeout) {
                return true;
            }
            session.detach_channel();
            debug!(session_id = %id, idle = ?session.idle_for(), "session expired");
            false
        });
        before - sessions.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = manager.sweep();
                if removed > 0 {
                    info!(removed, transport = %manager.transport, "swept expired sessions");
                }
            }
        })
    }

    /// Deliver one frame to every session with a live channel; sessions the
    /// transport cannot reach are skipped. Returns the delivered count.
    pub async fn broadcast(&self, frame: &Value) -> usize {
        let targets: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            sessions.values().cloned().collect()
        };

        let mut delivered = 0;
        for session in targets {
            if !session.has_channel() {
                continue;
            }
            match session.send_frame(frame.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(session_id = %session.id, error = %e, "broadcast delivery failed");
                }
            }
        }
        delivered
    }
}
