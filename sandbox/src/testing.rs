//! In-process scripted workers for tests.
//!
//! The scripted worker speaks the real bridge protocol over in-memory
//! channels and interprets a tiny command language instead of running real
//! code, so host-side behavior (PII boundary, allow-list, cache, timeouts)
//! is exercised without an external interpreter:
//!
//! - `context` / `context.a.b`: read the context and return (a path of) it
//! - `observe:a.b`: like `context.a.b`, also records what the worker saw
//!   (for PII assertions)
//! - `call:<tool> <json-args>`: invoke a tool through the bridge
//! - `log:<message>`: emit a log notification, return null
//! - `sleep:<ms>`: stall, then return null
//! - `error:runtime`: fail with a runtime error
//! - `crash:<anything>`: die without responding
//! - anything else: return `{"echo": <code>}`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use tmg_wire::{CallContext, GatewayResult};

use crate::bridge::{methods, BridgeMessage, BridgeToolHandler, WorkerError, WorkerErrorKind};
use crate::limits::SandboxLimits;
use crate::worker::{WorkerChannel, WorkerFactory};

/// Records a tool-call echo; stands in for the gateway dispatch table.
#[derive(Default)]
pub struct EchoToolHandler {
    pub calls: Mutex<Vec<(String, Value)>>,
}

#[async_trait]
impl BridgeToolHandler for EchoToolHandler {
    async fn call_tool(
        &self,
        qualified: &str,
        arguments: Value,
        _ctx: &CallContext,
    ) -> GatewayResult<Value> {
        self.calls
            .lock()
            .push((qualified.to_string(), arguments.clone()));
        Ok(json!({ "tool": qualified, "arguments": arguments }))
    }
}

pub struct ScriptedWorkerFactory {
    observed: Arc<Mutex<Option<Value>>>,
}

impl Default for ScriptedWorkerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedWorkerFactory {
    pub fn new() -> Self {
        Self {
            observed: Arc::new(Mutex::new(None)),
        }
    }

    /// What the last `observe:` worker actually saw.
    pub fn observed(&self) -> Option<Value> {
        self.observed.lock().clone()
    }
}

#[async_trait]
impl WorkerFactory for ScriptedWorkerFactory {
    async fn spawn(&self, _limits: &SandboxLimits) -> GatewayResult<Arc<dyn WorkerChannel>> {
        let (to_worker_tx, to_worker_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let (from_worker_tx, from_worker_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        tokio::spawn(worker_loop(
            to_worker_rx,
            from_worker_tx,
            Arc::clone(&self.observed),
        ));
        Ok(Arc::new(ScriptedChannel {
            to_worker: Mutex::new(Some(to_worker_tx)),
            from_worker: tokio::sync::Mutex::new(from_worker_rx),
        }))
    }
}

/// Counts spawns; used to prove cache hits skip execution.
pub struct CountingFactory {
    inner: ScriptedWorkerFactory,
    spawns: AtomicUsize,
}

impl Default for CountingFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            inner: ScriptedWorkerFactory::new(),
            spawns: AtomicUsize::new(0),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawns.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl WorkerFactory for CountingFactory {
    async fn spawn(&self, limits: &SandboxLimits) -> GatewayResult<Arc<dyn WorkerChannel>> {
        self.spawns.fetch_add(1, Ordering::Relaxed);
        self.inner.spawn(limits).await
    }
}

struct ScriptedChannel {
    to_worker: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    from_worker: tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl WorkerChannel for ScriptedChannel {
    async fn send(&self, frame: &[u8]) -> GatewayResult<()> {
        let guard = self.to_worker.lock();
        match guard.as_ref() {
            Some(tx) => {
                let _ = tx.send(frame.to_vec());
                Ok(())
            }
            None => Err(tmg_wire::GatewayError::sandbox_runtime(
                "scripted worker terminated",
            )),
        }
    }

    async fn recv(&self) -> GatewayResult<Option<Vec<u8>>> {
        let mut rx = self.from_worker.lock().await;
        Ok(rx.recv().await)
    }

    async fn terminate(&self, _grace: Duration) {
        self.to_worker.lock().take();
    }
}

async fn worker_loop(
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    observed: Arc<Mutex<Option<Value>>>,
) {
    while let Some(frame) = rx.recv().await {
        let Ok(BridgeMessage::RpcRequest { id, method, payload }) = BridgeMessage::decode(&frame)
        else {
            continue;
        };
        if method != methods::EXECUTE || id != 0 {
            continue;
        }
        let code = payload
            .get("code")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let context = payload.get("context").cloned().unwrap_or(Value::Null);
        if !run_script(&code, &context, &tx, &mut rx, &observed).await {
            // Crash: die without answering.
            return;
        }
    }
}

/// Interpret one scripted body; returns false to simulate a crash.
async fn run_script(
    code: &str,
    context: &Value,
    tx: &mpsc::UnboundedSender<Vec<u8>>,
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    observed: &Arc<Mutex<Option<Value>>>,
) -> bool {
    let reply = |message: BridgeMessage| {
        let _ = tx.send(message.encode());
    };

    if code.starts_with("crash:") {
        return false;
    }

    if let Some(rest) = code.strip_prefix("sleep:") {
        let millis: u64 = rest.trim().parse().unwrap_or(1000);
        tokio::time::sleep(Duration::from_millis(millis)).await;
        reply(BridgeMessage::ok(0, Value::Null));
        return true;
    }

    if code == "error:runtime" {
        reply(BridgeMessage::err(
            0,
            WorkerError {
                kind: WorkerErrorKind::Runtime,
                message: "scripted runtime failure".to_string(),
            },
        ));
        return true;
    }

    if let Some(message) = code.strip_prefix("log:") {
        reply(BridgeMessage::Notification {
            kind: "log".to_string(),
            payload: json!(message),
        });
        reply(BridgeMessage::ok(0, Value::Null));
        return true;
    }

    if code == "context" || code.starts_with("context.") || code.starts_with("observe:") {
        // Fetch the context through the bridge like real user code would.
        reply(BridgeMessage::request(1, methods::READ_CONTEXT, Value::Null));
        let Some(fetched) = await_response(rx, 1).await else {
            return false;
        };
        let Ok(fetched) = fetched else {
            reply(BridgeMessage::err(
                0,
                WorkerError {
                    kind: WorkerErrorKind::Runtime,
                    message: "read_context failed".to_string(),
                },
            ));
            return true;
        };
        let path = code
            .strip_prefix("observe:")
            .or_else(|| code.strip_prefix("context."))
            .unwrap_or("");
        let value = lookup_path(&fetched, path);
        if code.starts_with("observe:") {
            *observed.lock() = Some(value.clone());
        }
        reply(BridgeMessage::ok(0, value));
        return true;
    }

    if let Some(rest) = code.strip_prefix("call:") {
        let (tool, args_raw) = rest.split_once(' ').unwrap_or((rest, "{}"));
        let arguments: Value = serde_json::from_str(args_raw).unwrap_or(json!({}));
        reply(BridgeMessage::request(
            2,
            methods::CALL_TOOL,
            json!({ "name": tool, "arguments": arguments }),
        ));
        let Some(result) = await_response(rx, 2).await else {
            return false;
        };
        match result {
            Ok(value) => reply(BridgeMessage::ok(0, value)),
            Err(error) => reply(BridgeMessage::err(0, error)),
        }
        return true;
    }

    let _ = context;
    reply(BridgeMessage::ok(0, json!({ "echo": code })));
    true
}

async fn await_response(
    rx: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    want_id: u64,
) -> Option<Result<Value, WorkerError>> {
    while let Some(frame) = rx.recv().await {
        if let Ok(BridgeMessage::RpcResponse {
            id,
            success,
            result,
            error,
        }) = BridgeMessage::decode(&frame)
        {
            if id != want_id {
                continue;
            }
            return Some(if success {
                Ok(result.unwrap_or(Value::Null))
            } else {
                Err(error.unwrap_or(WorkerError {
                    kind: WorkerErrorKind::Runtime,
                    message: "unspecified bridge error".to_string(),
                }))
            });
        }
    }
    None
}

fn lookup_path(value: &Value, path: &str) -> Value {
    if path.is_empty() {
        return value.clone();
    }
    let mut current = value;
    for segment in path.split('.') {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            Value::Array(items) => match segment.parse::<usize>().ok().and_then(|i| items.get(i)) {
                Some(next) => current = next,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_path_walks_objects_and_arrays() {
        let value = json!({"a": {"b": [10, 20]}});
        assert_eq!(lookup_path(&value, "a.b.1"), json!(20));
        assert_eq!(lookup_path(&value, "a.missing"), Value::Null);
        assert_eq!(lookup_path(&value, ""), value);
    }
}
