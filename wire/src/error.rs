//! Gateway error taxonomy.
//!
//! Every failure surfaced to a caller carries a kind from a closed set, a
//! human message, optional structured details and a retryability flag.
//! Domain failures travel inside successful JSON-RPC responses; only
//! protocol violations become JSON-RPC errors.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::jsonrpc::RpcError;

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Closed set of failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Config,
    UpstreamTransport,
    UpstreamProtocol,
    UpstreamToolError,
    Timeout,
    Cancelled,
    Validation,
    Dependency,
    SandboxPermission,
    SandboxRuntime,
    SandboxMemory,
    Cache,
    Internal,
}

impl ErrorKind {
    /// Default retryability per kind. `Timeout` is per-caller and defaults
    /// to non-retryable here.
    pub fn default_retryable(self) -> bool {
        matches!(self, ErrorKind::UpstreamTransport | ErrorKind::Cache)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Config => "CONFIG",
            ErrorKind::UpstreamTransport => "UPSTREAM_TRANSPORT",
            ErrorKind::UpstreamProtocol => "UPSTREAM_PROTOCOL",
            ErrorKind::UpstreamToolError => "UPSTREAM_TOOL_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Dependency => "DEPENDENCY",
            ErrorKind::SandboxPermission => "SANDBOX_PERMISSION",
            ErrorKind::SandboxRuntime => "SANDBOX_RUNTIME",
            ErrorKind::SandboxMemory => "SANDBOX_MEMORY",
            ErrorKind::Cache => "CACHE",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{}: {message}", .kind.as_str())]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl GatewayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            retryable: kind.default_retryable(),
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamTransport, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamProtocol, message)
    }

    pub fn upstream_tool(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamToolError, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Cancelled, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Dependency, message)
    }

    pub fn sandbox_permission(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SandboxPermission, message)
    }

    pub fn sandbox_runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SandboxRuntime, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Envelope embedded in a *successful* JSON-RPC response for domain
    /// failures, preserving workflow correlation when available.
    pub fn to_payload(&self, workflow_id: Option<&str>) -> Value {
        let mut payload = json!({
            "status": "error",
            "error": self.message,
            "code": self.kind.as_str(),
            "retryable": self.retryable,
        });
        if let Some(details) = &self.details {
            payload["details"] = details.clone();
        }
        if let Some(id) = workflow_id {
            payload["workflow_id"] = json!(id);
        }
        payload
    }

    /// JSON-RPC error for protocol-level violations only.
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self.kind {
            ErrorKind::Validation => RpcError::INVALID_PARAMS,
            _ => RpcError::INTERNAL_ERROR,
        };
        RpcError::new(code, self.message.clone()).with_data(json!({
            "code": self.kind.as_str(),
            "retryable": self.retryable,
        }))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(e: std::io::Error) -> Self {
        GatewayError::transport(e.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::protocol(format!("malformed JSON: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_default_retryable() {
        let err = GatewayError::transport("pipe closed");
        assert!(err.retryable);
        assert_eq!(err.kind, ErrorKind::UpstreamTransport);
    }

    #[test]
    fn validation_errors_are_terminal() {
        let err = GatewayError::validation("bad schema");
        assert!(!err.retryable);
    }

    #[test]
    fn kind_serializes_screaming_snake() {
        let raw = serde_json::to_string(&ErrorKind::UpstreamToolError).unwrap();
        assert_eq!(raw, "\"UPSTREAM_TOOL_ERROR\"");
    }

    #[test]
    fn payload_carries_workflow_correlation() {
        let err = GatewayError::timeout("deadline exceeded");
        let payload = err.to_payload(Some("wf-1"));
        assert_eq!(payload["status"], "error");
        assert_eq!(payload["code"], "TIMEOUT");
        assert_eq!(payload["workflow_id"], "wf-1");
    }

    #[test]
    fn rpc_error_maps_validation_to_invalid_params() {
        let err = GatewayError::validation("missing field");
        assert_eq!(err.to_rpc_error().code, RpcError::INVALID_PARAMS);
    }

    #[test]
    fn display_includes_kind() {
        let err = GatewayError::cancelled("caller gave up");
        assert_eq!(err.to_string(), "CANCELLED: caller gave up");
    }
}
