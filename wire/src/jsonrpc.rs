//! JSON-RPC 2.0 message types.
//!
//! The gateway multiplexes concurrent requests over a single connection per
//! upstream, so `RequestId` allocation and response correlation live here
//! rather than in any one transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC protocol version marker. Serializes as the literal `"2.0"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Version {
    #[default]
    #[serde(rename = "2.0")]
    V2,
}

/// Request identifier. The gateway allocates numeric ids; string ids are
/// accepted from clients for compatibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Num(u64),
    Str(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Num(n) => write!(f, "{}", n),
            RequestId::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        RequestId::Num(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        RequestId::Str(s.to_string())
    }
}

/// A call expecting a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: Version,
    pub id: RequestId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version::V2,
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// A one-way message; carries no `id` and receives no response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub jsonrpc: Version,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: Version::V2,
            method: method.into(),
            params,
        }
    }
}

/// A reply correlated to a request by `id`. Exactly one of `result` and
/// `error` is populated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: Version,
    pub id: RequestId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: RequestId, result: Value) -> Self {
        Self {
            jsonrpc: Version::V2,
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, error: RpcError) -> Self {
        Self {
            jsonrpc: Version::V2,
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Any inbound JSON-RPC message.
///
/// Variant order matters for untagged deserialization: requests carry both
/// `id` and `method`, notifications only `method`, responses only `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Notification(Notification),
    Response(Response),
}

impl Message {
    /// Parse a single wire frame. Fails on anything that is not a complete
    /// JSON-RPC 2.0 message.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {}", method))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JSON-RPC error {}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_round_trips() {
        let req = Request::new(7u64, "tools/call", Some(json!({"name": "fs:read"})));
        let raw = serde_json::to_string(&req).unwrap();
        assert!(raw.contains("\"jsonrpc\":\"2.0\""));
        let parsed = Message::parse(&raw).unwrap();
        match parsed {
            Message::Request(r) => {
                assert_eq!(r.id, RequestId::Num(7));
                assert_eq!(r.method, "tools/call");
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn notification_has_no_id() {
        let raw = r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#;
        match Message::parse(raw).unwrap() {
            Message::Notification(n) => assert_eq!(n.method, "notifications/initialized"),
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn response_with_result_parses() {
        let raw = r#"{"jsonrpc":"2.0","id":3,"result":{"ok":true}}"#;
        match Message::parse(raw).unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::Num(3));
                assert!(!r.is_error());
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn response_with_error_parses() {
        let raw = r#"{"jsonrpc":"2.0","id":"abc","error":{"code":-32601,"message":"nope"}}"#;
        match Message::parse(raw).unwrap() {
            Message::Response(r) => {
                assert_eq!(r.id, RequestId::Str("abc".to_string()));
                assert_eq!(r.error.unwrap().code, RpcError::METHOD_NOT_FOUND);
            }
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[test]
    fn string_and_numeric_ids_are_distinct() {
        assert_ne!(RequestId::Num(1), RequestId::Str("1".to_string()));
    }

    #[test]
    fn rejects_wrong_version() {
        let raw = r#"{"jsonrpc":"1.0","id":1,"method":"x"}"#;
        assert!(Message::parse(raw).is_err());
    }
}
