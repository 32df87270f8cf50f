use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{Value, json};
use tracing::info;

use vecmcp::config::ServerConfig;
use vecmcp::registry::{InMemoryRegistry, PromptDef, ResourceDef, RootDef, ToolDef};
use vecmcp::server::Server;

#[derive(Debug, Clone, ValueEnum)]
enum TransportMode {
    Stdio,
    Http,
}

#[derive(Debug, Parser)]
#[command(name = "vecmcp", version, about = "Model Context Protocol server (Rust)")]
struct Cli {
    /// Transport mode (stdio for desktop clients, http for networked ones)
    #[arg(long, value_enum, default_value_t = TransportMode::Stdio)]
    transport: TransportMode,

    #[arg(long, env = "VECMCP_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "VECMCP_PORT", default_value_t = 8787)]
    port: u16,

    /// Route prefix for the HTTP transports
    #[arg(long, env = "VECMCP_PATH_PREFIX", default_value = "/mcp")]
    path_prefix: String,

    /// Idle seconds before a session is swept
    #[arg(long, env = "VECMCP_SESSION_TIMEOUT", default_value_t = 300)]
    session_timeout: u64,

    /// Events retained per transport for SSE resumption
    #[arg(long, env = "VECMCP_EVENT_RETENTION", default_value_t = 100)]
    event_retention: usize,

    /// Comma-separated Origin allow-list; "*" admits any
    #[arg(long, env = "VECMCP_ALLOWED_ORIGINS", default_value = "*", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Seconds a server-initiated request waits for the client's response
    #[arg(long, env = "VECMCP_REQUEST_TIMEOUT", default_value_t = 30)]
    request_timeout: u64,

    /// Name reported in initialize.result.serverInfo
    #[arg(long, env = "VECMCP_SERVER_NAME", default_value = "vecmcp")]
    server_name: String,
}

async fn demo_registry() -> anyhow::Result<Arc<InMemoryRegistry>> {
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register_tool(ToolDef::new(
            "echo",
            "Echo the provided text back to the caller",
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
        .await?;
    registry
        .register_prompt(PromptDef {
            name: "greet".to_string(),
            description: "A short greeting prompt".to_string(),
            content: "Please greet the user warmly.".to_string(),
        })
        .await?;
    registry
        .register_resource(ResourceDef::new(
            "mem://server-info",
            "server-info",
            "Static information about this server",
            "text/plain",
            |_| async move { Ok(format!("vecmcp {}", env!("CARGO_PKG_VERSION"))) },
        ))
        .await?;
    registry
        .register_root(RootDef {
            uri: "file:///".to_string(),
            name: "root".to_string(),
        })
        .await?;
    Ok(registry)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Stdio mode reserves stdout for JSON-RPC frames: log to stderr, no ANSI.
    match cli.transport {
        TransportMode::Stdio => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .init();
        }
        TransportMode::Http => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .init();
        }
    }

    let config = ServerConfig {
        name: cli.server_name,
        host: cli.host,
        port: cli.port,
        path_prefix: cli.path_prefix,
        session_timeout: Duration::from_secs(cli.session_timeout),
        event_retention: cli.event_retention,
        allowed_origins: cli.allowed_origins,
        request_timeout: Duration::from_secs(cli.request_timeout),
        ..ServerConfig::default()
    };

    let registry = demo_registry().await?;
    let server = Server::new(config, registry);

    match cli.transport {
        TransportMode::Stdio => {
            info!("MCP server starting (stdio)");
            server.run_stdio().await
        }
        TransportMode::Http => server.serve_http().await,
    }
}
