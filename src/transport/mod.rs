pub mod http;
pub mod sse;
pub mod stdio;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::McpResult;

/// A session's writable channel. `deliver` must have enqueued the frame
/// before it returns; actual delivery may still be asynchronous.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    async fn deliver(&self, frame: Value) -> McpResult<()>;
}
