//! Bridge protocol between the host and a worker.
//!
//! Length-delimited JSON frames carry three message shapes. The host sends
//! one `execute` request (id 0); the worker answers it when the code
//! finishes and may issue its own requests (`call_tool`, `log`,
//! `read_context`) in the meantime, correlated by worker-local ids.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tmg_wire::{CallContext, GatewayResult};

pub mod methods {
    pub const EXECUTE: &str = "execute";
    pub const CALL_TOOL: &str = "call_tool";
    pub const LOG: &str = "log";
    pub const READ_CONTEXT: &str = "read_context";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeMessage {
    RpcRequest {
        id: u64,
        method: String,
        payload: Value,
    },
    RpcResponse {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkerError>,
    },
    Notification {
        kind: String,
        payload: Value,
    },
}

impl BridgeMessage {
    pub fn request(id: u64, method: &str, payload: Value) -> Self {
        BridgeMessage::RpcRequest {
            id,
            method: method.to_string(),
            payload,
        }
    }

    pub fn ok(id: u64, result: Value) -> Self {
        BridgeMessage::RpcResponse {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: WorkerError) -> Self {
        BridgeMessage::RpcResponse {
            id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("bridge message serializes")
    }

    pub fn decode(frame: &[u8]) -> GatewayResult<Self> {
        serde_json::from_slice(frame)
            .map_err(|e| tmg_wire::GatewayError::sandbox_runtime(format!("bad bridge frame: {}", e)))
    }
}

/// Typed worker-side failure, mapped onto the gateway taxonomy by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerError {
    pub kind: WorkerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    Timeout,
    Memory,
    Permission,
    Runtime,
    Cancelled,
}

impl WorkerError {
    pub fn to_gateway_error(&self) -> tmg_wire::GatewayError {
        use tmg_wire::{ErrorKind, GatewayError};
        let kind = match self.kind {
            WorkerErrorKind::Timeout => ErrorKind::Timeout,
            WorkerErrorKind::Memory => ErrorKind::SandboxMemory,
            WorkerErrorKind::Permission => ErrorKind::SandboxPermission,
            WorkerErrorKind::Runtime => ErrorKind::SandboxRuntime,
            WorkerErrorKind::Cancelled => ErrorKind::Cancelled,
        };
        GatewayError::new(kind, self.message.clone())
    }
}

/// Host-side handler for worker `call_tool` requests. Implemented by the
/// gateway over its dispatch table; the sandbox enforces the allow-list
/// before this is reached.
#[async_trait]
pub trait BridgeToolHandler: Send + Sync {
    async fn call_tool(
        &self,
        qualified: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> GatewayResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_round_trip() {
        let message = BridgeMessage::request(3, methods::CALL_TOOL, json!({"name": "fs:read"}));
        let decoded = BridgeMessage::decode(&message.encode()).unwrap();
        match decoded {
            BridgeMessage::RpcRequest { id, method, payload } => {
                assert_eq!(id, 3);
                assert_eq!(method, "call_tool");
                assert_eq!(payload["name"], "fs:read");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn worker_error_kinds_map_to_taxonomy() {
        let err = WorkerError {
            kind: WorkerErrorKind::Memory,
            message: "heap exhausted".to_string(),
        };
        assert_eq!(
            err.to_gateway_error().kind,
            tmg_wire::ErrorKind::SandboxMemory
        );
        let err = WorkerError {
            kind: WorkerErrorKind::Permission,
            message: "denied".to_string(),
        };
        assert_eq!(
            err.to_gateway_error().kind,
            tmg_wire::ErrorKind::SandboxPermission
        );
    }

    #[test]
    fn error_response_shape() {
        let message = BridgeMessage::err(
            1,
            WorkerError {
                kind: WorkerErrorKind::Runtime,
                message: "boom".to_string(),
            },
        );
        let raw = serde_json::to_value(&message).unwrap();
        assert_eq!(raw["type"], "rpc_response");
        assert_eq!(raw["success"], false);
        assert_eq!(raw["error"]["kind"], "runtime");
    }
}
