//! Server configuration surface. The binary populates this from CLI flags
//! and environment; embedders construct it directly.

use std::time::Duration;

use crate::events::DEFAULT_EVENT_RETENTION;
use crate::outbound::DEFAULT_REQUEST_TIMEOUT;
use crate::session::{DEFAULT_SESSION_TIMEOUT, DEFAULT_SWEEP_INTERVAL};

/// Protocol version the server negotiates. Clients asking for a different
/// version get this one back, with a warning logged.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server identity reported in `initialize.result.serverInfo`.
    pub name: String,
    pub version: String,
    pub protocol_version: String,

    pub host: String,
    pub port: u16,
    /// Route prefix for both HTTP transports, e.g. `/mcp`.
    pub path_prefix: String,

    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub event_retention: usize,
    /// Allowed `Origin` values; `"*"` admits any. Requests without an
    /// Origin header (server-to-server callers) are always admitted.
    pub allowed_origins: Vec<String>,
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: "vecmcp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8787,
            path_prefix: "/mcp".to_string(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            event_retention: DEFAULT_EVENT_RETENTION,
            allowed_origins: vec!["*".to_string()],
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let Some(origin) = origin else {
            return true;
        };
        self.allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.path_prefix, "/mcp");
        assert_eq!(config.session_timeout, Duration::from_secs(300));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.event_retention, 100);
        assert_eq!(config.protocol_version, "2024-11-05");
    }

    #[test]
    fn test_origin_wildcard_admits_everything() {
        let config = ServerConfig::default();
        assert!(config.origin_allowed(Some("https://anywhere.example")));
        assert!(config.origin_allowed(None));
    }

    #[test]
    fn test_origin_allow_list() {
        let config = ServerConfig {
            allowed_origins: vec!["https://app.example".to_string()],
            ..ServerConfig::default()
        };
        assert!(config.origin_allowed(Some("https://app.example")));
        assert!(!config.origin_allowed(Some("https://evil.example")));
        assert!(config.origin_allowed(None));
    }
}
