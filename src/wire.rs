//! JSON-RPC 2.0 wire codec: frame model, classification, and encoding.
//!
//! Classification is by shape, not by a wrapper tag: a frame with `method`
//! and `id` is a request, `method` alone is a notification, `id` alone is a
//! response. Malformed input still gets a best-effort id scan so the caller
//! can answer with a well-formed parse-error frame.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ErrorObject, McpError, McpResult};

pub const JSONRPC_VERSION: &str = "2.0";

/// Request id: string or integer, type-preserving end to end.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// A response frame. A well-formed response carries exactly one of `result`
/// or `error`; one with neither is still classified here so the outbound
/// registry can reject it as a malformed reply instead of dropping it.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub result: Option<Value>,
    pub error: Option<ErrorObject>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    pub fn to_value(&self) -> Value {
        match self {
            Self::Request(r) => {
                let mut frame = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "method": r.method,
                });
                if let Some(params) = &r.params {
                    frame["params"] = params.clone();
                }
                frame
            }
            Self::Notification(n) => {
                let mut frame = json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "method": n.method,
                });
                if let Some(params) = &n.params {
                    frame["params"] = params.clone();
                }
                frame
            }
            Self::Response(r) => match (&r.result, &r.error) {
                (_, Some(error)) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "error": error,
                }),
                (result, None) => json!({
                    "jsonrpc": JSONRPC_VERSION,
                    "id": r.id,
                    "result": result.clone().unwrap_or(Value::Null),
                }),
            },
        }
    }
}

/// Decode a single frame. On parse failure the returned error carries the
/// best-effort recovered id.
pub fn decode(raw: &str) -> McpResult<Message> {
    let trimmed = raw.trim_start();
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return Err(McpError::parse(recover_id(raw)));
    }
    let value: Value =
        serde_json::from_str(raw).map_err(|_| McpError::parse(recover_id(raw)))?;
    classify(value)
}

/// Classify a decoded value into a request, notification, or response.
/// Anything else is a hard `-32600` with whatever id could be read.
pub fn classify(value: Value) -> McpResult<Message> {
    let Value::Object(obj) = value else {
        return Err(McpError::invalid_request("expected a JSON object frame"));
    };

    let id = match obj.get("id") {
        None | Some(Value::Null) => None,
        Some(v) => Some(parse_id(v).ok_or_else(|| {
            McpError::invalid_request("id must be a string or an integer")
        })?),
    };
    let params = obj.get("params").cloned().filter(|p| !p.is_null());

    match obj.get("method") {
        Some(Value::String(method)) => {
            let method = method.clone();
            Ok(match id {
                Some(id) => Message::Request(Request { id, method, params }),
                None => Message::Notification(Notification { method, params }),
            })
        }
        Some(_) => {
            let mut err = McpError::invalid_request("method must be a string");
            if let Some(id) = id {
                err = err.with_request_id(id);
            }
            Err(err)
        }
        None => {
            let Some(id) = id else {
                return Err(McpError::invalid_request(
                    "frame has neither method nor id",
                ));
            };
            let result = obj.get("result").cloned();
            let error = match obj.get("error") {
                None => None,
                Some(e) => Some(
                    serde_json::from_value::<ErrorObject>(e.clone()).map_err(|_| {
                        McpError::invalid_request("malformed error object")
                            .with_request_id(id.clone())
                    })?,
                ),
            };
            if result.is_some() && error.is_some() {
                return Err(McpError::invalid_request(
                    "response carries both result and error",
                )
                .with_request_id(id));
            }
            Ok(Message::Response(Response { id, result, error }))
        }
    }
}

pub fn encode(message: &Message) -> String {
    message.to_value().to_string()
}

fn parse_id(v: &Value) -> Option<RequestId> {
    match v {
        Value::String(s) => Some(RequestId::String(s.clone())),
        Value::Number(n) => n.as_i64().map(RequestId::Number),
        _ => None,
    }
}

/// Best-effort scan of a malformed frame for `"id": <string|integer>`.
fn recover_id(raw: &str) -> Option<RequestId> {
    let bytes = raw.as_bytes();
    let mut from = 0;
    while let Some(found) = raw[from..].find("\"id\"") {
        let mut i = from + found + 4;
        from = i;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() || bytes[i] != b':' {
            continue;
        }
        i += 1;
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            return None;
        }
        match bytes[i] {
            b'"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'"' {
                    if bytes[j] == b'\\' {
                        j += 1;
                    }
                    j += 1;
                }
                if j < bytes.len() {
                    return Some(RequestId::String(raw[start..j].to_string()));
                }
                return None;
            }
            b'-' | b'0'..=b'9' => {
                let start = i;
                let mut j = i + 1;
                while j < bytes.len() && bytes[j].is_ascii_digit() {
                    j += 1;
                }
                return raw[start..j].parse::<i64>().ok().map(RequestId::Number);
            }
            _ => continue,
        }
    }
    None
}

/// Frame builders used by the dispatcher and transports.
pub fn response_frame(id: &RequestId, result: Value) -> Value {
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "result": result,
    })
}

pub fn error_frame(id: Option<&RequestId>, err: &McpError) -> Value {
    let id = err
        .request_id()
        .or(id)
        .map(|i| serde_json::to_value(i).unwrap_or(Value::Null))
        .unwrap_or(Value::Null);
    json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": err.error_object(),
    })
}

pub fn request_frame(id: &str, method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

pub fn notification_frame(method: &str, params: Option<Value>) -> Value {
    let mut frame = json!({
        "jsonrpc": JSONRPC_VERSION,
        "method": method,
    });
    if let Some(params) = params {
        frame["params"] = params;
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_request() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        match msg {
            Message::Request(r) => {
                assert_eq!(r.id, RequestId::Number(1));
                assert_eq!(r.method, "ping");
                assert!(r.params.is_none());
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_notification() {
        let msg = decode(r#"{"jsonrpc":"2.0","method":"initialized"}"#).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn test_classify_response_result() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":"x","result":{"ok":true}}"#).unwrap();
        match msg {
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::String("x".into()));
                assert!(r.result.is_some());
                assert!(r.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_response_error() {
        let msg =
            decode(r#"{"jsonrpc":"2.0","id":9,"error":{"code":-32601,"message":"nope"}}"#)
                .unwrap();
        match msg {
            Message::Response(r) => assert_eq!(r.error.unwrap().code, -32601),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_response_without_result_still_classifies() {
        // The outbound registry rejects it as "missing result field".
        let msg = decode(r#"{"jsonrpc":"2.0","id":"q"}"#).unwrap();
        match msg {
            Message::Response(r) => {
                assert!(r.result.is_none());
                assert!(r.error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_with_both_result_and_error_is_invalid() {
        let err =
            decode(r#"{"jsonrpc":"2.0","id":1,"result":{},"error":{"code":1,"message":"x"}}"#)
                .unwrap_err();
        assert_eq!(err.code(), -32600);
        assert_eq!(err.request_id(), Some(&RequestId::Number(1)));
    }

    #[test]
    fn test_fast_reject_non_json_prefix() {
        let err = decode("hello world").unwrap_err();
        assert_eq!(err.code(), -32700);
    }

    #[test]
    fn test_recover_integer_id_from_truncated_frame() {
        let err = decode(r#"{"jsonrpc":"2.0","id":42,"method":"#).unwrap_err();
        assert_eq!(err.code(), -32700);
        assert_eq!(err.request_id(), Some(&RequestId::Number(42)));
    }

    #[test]
    fn test_recover_string_id_from_truncated_frame() {
        let err = decode(r#"{"id":"abc-7","method":"x","params":{"#).unwrap_err();
        assert_eq!(err.request_id(), Some(&RequestId::String("abc-7".into())));
    }

    #[test]
    fn test_recover_negative_id() {
        let err = decode(r#"{"id": -3, "method":"#).unwrap_err();
        assert_eq!(err.request_id(), Some(&RequestId::Number(-3)));
    }

    #[test]
    fn test_no_id_to_recover() {
        let err = decode(r#"{"method":"#).unwrap_err();
        assert!(err.request_id().is_none());
    }

    #[test]
    fn test_fractional_id_is_invalid() {
        let err = decode(r#"{"jsonrpc":"2.0","id":1.5,"method":"ping"}"#).unwrap_err();
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_null_id_means_notification() {
        let msg = decode(r#"{"jsonrpc":"2.0","id":null,"method":"ping"}"#).unwrap();
        assert!(matches!(msg, Message::Notification(_)));
    }

    #[test]
    fn test_array_frame_is_invalid() {
        let err = decode("[1,2,3]").unwrap_err();
        assert_eq!(err.code(), -32600);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = [
            r#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{"cursor":null}}"#,
            r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":7}}"#,
            r#"{"jsonrpc":"2.0","id":"s","result":{"tools":[]}}"#,
            r#"{"jsonrpc":"2.0","id":2,"error":{"code":-32601,"message":"Method not found"}}"#,
        ];
        for raw in frames {
            let msg = decode(raw).unwrap();
            let reencoded = encode(&msg);
            assert_eq!(decode(&reencoded).unwrap(), msg, "roundtrip for {raw}");
        }
    }

    #[test]
    fn test_encode_always_carries_version() {
        let msg = Message::Notification(Notification {
            method: "heartbeat".into(),
            params: None,
        });
        let value = msg.to_value();
        assert_eq!(value["jsonrpc"], "2.0");
        assert!(value.get("params").is_none());
    }

    #[test]
    fn test_id_type_preserved_through_encode() {
        let string_frame = decode(r#"{"jsonrpc":"2.0","id":"1","method":"ping"}"#).unwrap();
        assert!(encode(&string_frame).contains(r#""id":"1""#));
        let number_frame = decode(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).unwrap();
        assert!(encode(&number_frame).contains(r#""id":1"#));
    }

    #[test]
    fn test_error_frame_null_id_when_unrecovered() {
        let frame = error_frame(None, &McpError::parse(None));
        assert_eq!(frame["id"], Value::Null);
        assert_eq!(frame["error"]["code"], -32700);
    }
}
