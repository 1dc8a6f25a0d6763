//! Dispatch seam between the engine and the rest of the gateway.
//!
//! The scheduler stays agnostic of transports and sandboxes: every task
//! kind funnels through this trait, which the gateway wires to the
//! upstream manager, the sandbox runtime and the registry.

use async_trait::async_trait;
use serde_json::Value;

use tmg_wire::{CallContext, GatewayResult};

/// One sandboxed code execution.
#[derive(Debug, Clone)]
pub struct CodeRequest {
    pub code: String,
    /// Intent string used to derive the sandbox tool allow-list.
    pub intent: Option<String>,
    /// Context object handed to the code (already reference-resolved).
    pub context: Value,
    /// Per-task sandbox overrides (timeout, memory, PII flag).
    pub sandbox: Option<Value>,
    /// Shadow execution for speculation; results must be side-effect free
    /// to commit.
    pub speculative: bool,
}

#[async_trait]
pub trait TaskDispatcher: Send + Sync {
    /// Invoke an upstream tool addressed as `server:tool` and return its
    /// structured output.
    async fn call_tool(
        &self,
        target: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> GatewayResult<Value>;

    /// Run code in the sandbox and return its value.
    async fn execute_code(&self, request: CodeRequest, ctx: &CallContext) -> GatewayResult<Value>;

    /// Expand a capability into its plan blob (`{"tasks": [...]}`).
    async fn expand_capability(&self, capability: &str) -> GatewayResult<Value>;

    /// When `Some(reason)`, invoking this subject requires an approval
    /// pause unless it was already approved for the workflow.
    fn needs_approval(&self, subject: &str) -> Option<String>;

    /// Persist an approve-always decision to the allow-list.
    fn approve_always(&self, subject: &str);

    /// Feedback hook for capability success-rate bookkeeping.
    fn record_capability_outcome(&self, _capability: &str, _success: bool) {}
}
