//! Sandboxed code execution.
//!
//! Every execution gets a fresh worker with default-deny capabilities and a
//! narrow, audited RPC bridge back into the gateway for tool calls. The
//! host scrubs PII from the context before hand-off, enforces wall-clock
//! and memory limits, and caches results keyed by code + context + tool
//! schema versions.

pub mod bridge;
pub mod cache;
pub mod code;
pub mod limits;
pub mod pii;
pub mod runtime;
pub mod testing;
pub mod worker;

pub use bridge::{BridgeMessage, BridgeToolHandler};
pub use cache::ResultCache;
pub use code::CodeShape;
pub use limits::SandboxLimits;
pub use pii::PiiScrubber;
pub use runtime::{ExecutionRequest, ExecutionResult, SandboxConfig, SandboxRuntime};
pub use worker::{ProcessWorkerFactory, WorkerChannel, WorkerFactory};
