//! Wire layer shared by every gateway crate.
//!
//! Contains the JSON-RPC 2.0 message types, the MCP method payloads the
//! gateway speaks on both its client and server sides, stdio/bridge framing
//! codecs, and the closed error taxonomy surfaced to callers.

pub mod context;
pub mod error;
pub mod framing;
pub mod jsonrpc;
pub mod mcp;

pub use context::CallContext;
pub use error::{ErrorKind, GatewayError, GatewayResult};
pub use jsonrpc::{Message, Notification, Request, RequestId, Response, RpcError};

/// Short stable fingerprint of a JSON value.
///
/// Object keys are serialized in sorted order (serde_json's default map),
/// so structurally equal values produce equal fingerprints.
pub fn fingerprint(value: &serde_json::Value) -> String {
    let canonical = serde_json::to_string(value).unwrap_or_default();
    let hash = blake3::hash(canonical.as_bytes());
    hash.to_hex()[..16].to_string()
}

/// Content hash over arbitrary text fields, used for descriptor and
/// capability invalidation.
pub fn content_hash(parts: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}
