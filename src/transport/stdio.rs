//! Stdio transport: one JSON frame per line on each stream, one peer, one
//! implicit session bound to the process lifetime.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::dispatch::Dispatcher;
use crate::error::{McpError, McpResult};
use crate::session::{RequestContext, SessionManager, STDIO_SESSION_ID};
use crate::transport::OutboundChannel;
use crate::wire::{self, Message};

/// Serialized, immediately-flushed writer shared by responses, broadcasts,
/// and outbound requests. A broken pipe shuts the transport down.
struct StdioChannel<W> {
    writer: Arc<Mutex<W>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl<W> OutboundChannel for StdioChannel<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    async fn deliver(&self, frame: Value) -> McpResult<()> {
        let mut writer = self.writer.lock().await;
        let line = format!("{frame}\n");
        let wrote = async {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = wrote {
            error!(error = %e, "stdio write failed, shutting down");
            self.shutdown.cancel();
            return Err(McpError::TransportClosed);
        }
        Ok(())
    }
}

pub struct StdioTransport {
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionManager>,
}

impl StdioTransport {
    pub fn new(dispatcher: Arc<Dispatcher>, sessions: Arc<SessionManager>) -> Self {
        Self {
            dispatcher,
            sessions,
        }
    }

    /// Serve the process's stdin/stdout until EOF or a broken pipe.
    pub async fn run(&self) -> anyhow::Result<()> {
        self.run_with(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
            .await
    }

    /// Generic over the streams so tests can drive the loop with in-memory
    /// pipes.
    pub async fn run_with<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shutdown = CancellationToken::new();
        let channel = Arc::new(StdioChannel {
            writer: Arc::new(Mutex::new(writer)),
            shutdown: shutdown.clone(),
        });

        let session = self.sessions.get_or_create(
            Some(STDIO_SESSION_ID),
            RequestContext::for_transport("stdio"),
        );
        session.attach_channel(channel.clone());
        info!("MCP server ready (stdio)");

        let mut lines = reader.lines();
        loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break,
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "stdio read failed");
                    return Err(e.into());
                }
            };

            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            session.replace_context(RequestContext::for_transport("stdio"));

            match wire::decode(raw) {
                // Requests run concurrently; notifications and response
                // frames are handled inline so lifecycle signals like
                // `initialized` land before the next line is read.
                Ok(message @ Message::Request(_)) => {
                    let dispatcher = self.dispatcher.clone();
                    let session = session.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        if let Some(frame) = dispatcher.dispatch(message, &session).await
                            && let Err(e) = channel.deliver(frame).await
                        {
                            debug!(error = %e, "response dropped, transport closing");
                        }
                    });
                }
                Ok(message) => {
                    self.dispatcher.dispatch(message, &session).await;
                }
                Err(e) => {
                    // A parse error is never dropped silently on stdio.
                    let frame = wire::error_frame(None, &e);
                    if channel.deliver(frame).await.is_err() {
                        break;
                    }
                }
            }
        }

        self.dispatcher.outbound().shutdown();
        Ok(())
    }
}
