//! Correlation of server-initiated requests with their client responses.
//!
//! Each send registers a one-shot completion slot keyed by a process-unique
//! id, hands the frame to the session's channel, and suspends the caller
//! until the matching response frame arrives or the timeout elapses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{McpError, McpResult};
use crate::session::Session;
use crate::wire::{self, RequestId, Response};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OutboundRegistry {
    default_timeout: Duration,
    counter: AtomicU64,
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
}

impl OutboundRegistry {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            counter: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn next_id(&self) -> String {
        let tag: u16 = rand::rng().random();
        format!(
            "vecmcp_{}_{:04x}_{}",
            std::process::id(),
            tag,
            self.counter.fetch_add(1, Ordering::SeqCst)
        )
    }

    /// Send a request over the session's channel and wait for the correlated
    /// response. The session must have a writable channel before a slot is
    /// created; a timeout removes the slot and surfaces as sampling-timeout.
    pub async fn send(
        &self,
        session: &Session,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> McpResult<Value> {
        let Some(channel) = session.channel() else {
            return Err(McpError::TransportClosed);
        };
        let timeout = timeout.unwrap_or(self.default_timeout);

        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("outbound map lock poisoned")
            .insert(id.clone(), tx);

        let frame = wire::request_frame(&id, method, params);
        session.touch();
        if let Err(e) = channel.deliver(frame).await {
            self.remove(&id);
            return Err(e);
        }
        debug!(request_id = %id, method, "outbound request sent");

        match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.remove(&id);
                Err(McpError::SamplingTimeout {
                    seconds: timeout.as_secs(),
                    request_id: Some(RequestId::String(id)),
                })
            }
            Ok(Err(_)) => Err(McpError::TransportClosed),
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    return Err(McpError::sampling(error.message, Some(error.code)));
                }
                response
                    .result
                    .ok_or_else(|| McpError::sampling("missing result field", None))
            }
        }
    }

    /// Complete the pending slot for a response frame. Duplicate or late
    /// deliveries are logged and dropped.
    pub fn deliver(&self, response: &Response) -> bool {
        let RequestId::String(id) = &response.id else {
            warn!(response_id = %response.id, "response id does not match any outbound request");
            return false;
        };
        let slot = self
            .pending
            .lock()
            .expect("outbound map lock poisoned")
            .remove(id);
        match slot {
            Some(tx) => {
                if tx.send(response.clone()).is_err() {
                    debug!(request_id = %id, "outbound caller already gave up");
                }
                true
            }
            None => {
                warn!(request_id = %id, "dropping response with no pending outbound request");
                false
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending
            .lock()
            .expect("outbound map lock poisoned")
            .len()
    }

    /// Transport shutdown. Pending slots are left to time out naturally so
    /// an imminent delivery is not raced with a forced rejection.
    pub fn shutdown(&self) {
        let pending = self.pending_count();
        if pending > 0 {
            debug!(pending, "transport closed with outbound requests still waiting");
        }
    }

    fn remove(&self, id: &str) {
        self.pending
            .lock()
            .expect("outbound map lock poisoned")
            .remove(id);
    }
}

impl Default for OutboundRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RequestContext, SessionManager};
    use crate::transport::OutboundChannel;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct CapturingChannel {
        frames: Mutex<Vec<Value>>,
    }

    impl CapturingChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frames: Mutex::new(Vec::new()),
            })
        }

        fn sent_id(&self) -> String {
            let frames = self.frames.lock().unwrap();
            frames[0]["id"].as_str().unwrap().to_string()
        }
    }

    #[async_trait]
    impl OutboundChannel for CapturingChannel {
        async fn deliver(&self, frame: Value) -> McpResult<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn session_with_channel() -> (Arc<crate::session::Session>, Arc<CapturingChannel>) {
        let manager = SessionManager::new("test", Duration::from_secs(300));
        let session = manager.get_or_create(None, RequestContext::for_transport("test"));
        let channel = CapturingChannel::new();
        session.attach_channel(channel.clone());
        (session, channel)
    }

    #[test]
    fn test_id_format() {
        let registry = OutboundRegistry::default();
        let id = registry.next_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts[0], "vecmcp");
        assert_eq!(parts[1], std::process::id().to_string());
        assert_eq!(parts[2].len(), 4);
        assert_eq!(parts[3], "1");
        assert!(registry.next_id().ends_with("_2"));
    }

    #[tokio::test]
    async fn test_send_without_channel_refuses_before_slot_creation() {
        let registry = OutboundRegistry::default();
        let manager = SessionManager::new("test", Duration::from_secs(300));
        let session = manager.get_or_create(None, RequestContext::for_transport("test"));
        let err = registry
            .send(&session, "sampling/createMessage", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::TransportClosed));
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_resolves_with_delivered_result() {
        let registry = Arc::new(OutboundRegistry::default());
        let (session, channel) = session_with_channel();

        let send = {
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move {
                registry
                    .send(
                        &session,
                        "sampling/createMessage",
                        Some(json!({"maxTokens": 16})),
                        Some(Duration::from_secs(2)),
                    )
                    .await
            })
        };

        // Wait for the frame to hit the channel, then answer it.
        let id = loop {
            {
                let frames = channel.frames.lock().unwrap();
                if !frames.is_empty() {
                    drop(frames);
                    break channel.sent_id();
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        assert!(registry.deliver(&Response {
            id: RequestId::String(id),
            result: Some(json!({"role": "assistant"})),
            error: None,
        }));

        let result = send.await.unwrap().unwrap();
        assert_eq!(result["role"], "assistant");
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_releases_slot() {
        let registry = OutboundRegistry::default();
        let (session, _channel) = session_with_channel();
        for _ in 0..10 {
            let err = registry
                .send(
                    &session,
                    "sampling/createMessage",
                    None,
                    Some(Duration::from_millis(10)),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, McpError::SamplingTimeout { .. }));
        }
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_client_error_frame_raises_sampling_error() {
        let registry = Arc::new(OutboundRegistry::default());
        let (session, channel) = session_with_channel();

        let send = {
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move {
                registry
                    .send(&session, "sampling/createMessage", None, Some(Duration::from_secs(2)))
                    .await
            })
        };

        let id = loop {
            if !channel.frames.lock().unwrap().is_empty() {
                break channel.sent_id();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        registry.deliver(&Response {
            id: RequestId::String(id),
            result: None,
            error: Some(crate::error::ErrorObject {
                code: -1,
                message: "user rejected".into(),
                data: None,
            }),
        });

        match send.await.unwrap().unwrap_err() {
            McpError::Sampling { message, code, .. } => {
                assert_eq!(message, "user rejected");
                assert_eq!(code, Some(-1));
            }
            other => panic!("expected sampling error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_response_missing_result_raises_sampling_error() {
        let registry = Arc::new(OutboundRegistry::default());
        let (session, channel) = session_with_channel();

        let send = {
            let registry = registry.clone();
            let session = session.clone();
            tokio::spawn(async move {
                registry
                    .send(&session, "sampling/createMessage", None, Some(Duration::from_secs(2)))
                    .await
            })
        };

        let id = loop {
            if !channel.frames.lock().unwrap().is_empty() {
                break channel.sent_id();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };

        registry.deliver(&Response {
            id: RequestId::String(id),
            result: None,
            error: None,
        });

        match send.await.unwrap().unwrap_err() {
            McpError::Sampling { message, .. } => assert_eq!(message, "missing result field"),
            other => panic!("expected sampling error, got {other:?}"),
        }
    }

    #[test]
    fn test_late_delivery_is_dropped() {
        let registry = OutboundRegistry::default();
        assert!(!registry.deliver(&Response {
            id: RequestId::String("vecmcp_1_dead_9".into()),
            result: Some(json!({})),
            error: None,
        }));
    }

    #[test]
    fn test_numeric_response_id_never_matches() {
        let registry = OutboundRegistry::default();
        assert!(!registry.deliver(&Response {
            id: RequestId::Number(7),
            result: Some(json!({})),
            error: None,
        }));
    }
}
