use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::wire::RequestId;

/// JSON-RPC 2.0 error codes used on the wire.
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const INITIALIZATION_ERROR: i64 = -32002;
pub const NOT_FOUND: i64 = -32001;

/// The `error` member of a JSON-RPC response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Protocol error taxonomy. Every variant maps to a JSON-RPC error code and
/// optionally remembers the request id it belongs to so transports can emit
/// a well-formed error response.
#[derive(Debug, Clone, thiserror::Error)]
pub enum McpError {
    #[error("Parse error")]
    Parse {
        data: Option<Value>,
        request_id: Option<RequestId>,
    },

    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        data: Option<Value>,
        request_id: Option<RequestId>,
    },

    #[error("Method not found: {method}")]
    MethodNotFound {
        method: String,
        request_id: Option<RequestId>,
    },

    #[error("Invalid params: {message}")]
    InvalidParams {
        message: String,
        data: Option<Value>,
        request_id: Option<RequestId>,
    },

    #[error("{message}")]
    Internal {
        message: String,
        data: Option<Value>,
        request_id: Option<RequestId>,
    },

    #[error("{message}")]
    Initialization {
        message: String,
        request_id: Option<RequestId>,
    },

    #[error("Not found: {message}")]
    NotFound {
        message: String,
        data: Option<Value>,
        request_id: Option<RequestId>,
    },

    /// Error frame returned by the client for a server-initiated request.
    #[error("Sampling error: {message}")]
    Sampling {
        message: String,
        code: Option<i64>,
        request_id: Option<RequestId>,
    },

    /// A server-initiated request saw no response within its timeout.
    #[error("Sampling request timed out after {seconds}s")]
    SamplingTimeout {
        seconds: u64,
        request_id: Option<RequestId>,
    },

    /// The session has no writable channel, or the channel broke mid-send.
    #[error("Transport closed")]
    TransportClosed,
}

pub type McpResult<T> = Result<T, McpError>;

impl McpError {
    pub fn parse(recovered_id: Option<RequestId>) -> Self {
        Self::Parse {
            data: None,
            request_id: recovered_id,
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    pub fn method_not_found(method: impl Into<String>) -> Self {
        Self::MethodNotFound {
            method: method.into(),
            request_id: None,
        }
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    /// The sanitized form every unexpected handler failure is reduced to.
    /// The original failure goes to the log, never onto the wire.
    pub fn internal_sanitized(method: &str) -> Self {
        Self::Internal {
            message: "Request handler failed".to_string(),
            data: Some(json!({
                "method": method,
                "error": "An internal error occurred",
            })),
            request_id: None,
        }
    }

    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization {
            message: message.into(),
            request_id: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
            data: None,
            request_id: None,
        }
    }

    pub fn sampling(message: impl Into<String>, code: Option<i64>) -> Self {
        Self::Sampling {
            message: message.into(),
            code,
            request_id: None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Parse { .. } => PARSE_ERROR,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Initialization { .. } => INITIALIZATION_ERROR,
            Self::NotFound { .. } => NOT_FOUND,
            Self::Sampling { code, .. } => code.unwrap_or(INTERNAL_ERROR),
            Self::SamplingTimeout { .. } | Self::TransportClosed => INTERNAL_ERROR,
        }
    }

    pub fn request_id(&self) -> Option<&RequestId> {
        match self {
            Self::Parse { request_id, .. }
            | Self::InvalidRequest { request_id, .. }
            | Self::MethodNotFound { request_id, .. }
            | Self::InvalidParams { request_id, .. }
            | Self::Internal { request_id, .. }
            | Self::Initialization { request_id, .. }
            | Self::NotFound { request_id, .. }
            | Self::Sampling { request_id, .. }
            | Self::SamplingTimeout { request_id, .. } => request_id.as_ref(),
            Self::TransportClosed => None,
        }
    }

    /// Fill in the request id if the error does not already carry one.
    pub fn with_request_id(mut self, id: RequestId) -> Self {
        match &mut self {
            Self::Parse { request_id, .. }
            | Self::InvalidRequest { request_id, .. }
            | Self::MethodNotFound { request_id, .. }
            | Self::InvalidParams { request_id, .. }
            | Self::Internal { request_id, .. }
            | Self::Initialization { request_id, .. }
            | Self::NotFound { request_id, .. }
            | Self::Sampling { request_id, .. }
            | Self::SamplingTimeout { request_id, .. } => {
                if request_id.is_none() {
                    *request_id = Some(id);
                }
            }
            Self::TransportClosed => {}
        }
        self
    }

    fn data(&self) -> Option<Value> {
        match self {
            Self::Parse { data, .. }
            | Self::InvalidRequest { data, .. }
            | Self::InvalidParams { data, .. }
            | Self::Internal { data, .. }
            | Self::NotFound { data, .. } => data.clone(),
            _ => None,
        }
    }

    pub fn error_object(&self) -> ErrorObject {
        ErrorObject {
            code: self.code(),
            message: self.to_string(),
            data: self.data(),
        }
    }
}
