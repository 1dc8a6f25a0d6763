//! The sandbox host: cache, PII boundary, worker lifecycle, bridge loop.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use tmg_wire::{CallContext, ErrorKind, GatewayError, GatewayResult};

use crate::bridge::{methods, BridgeMessage, BridgeToolHandler, WorkerError, WorkerErrorKind};
use crate::cache::ResultCache;
use crate::code::{self, CodeShape};
use crate::limits::SandboxLimits;
use crate::pii::PiiScrubber;
use crate::worker::{ProcessWorkerFactory, WorkerChannel, WorkerFactory};

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Worker launch command; the program speaks the bridge protocol on
    /// stdio.
    pub worker_command: Vec<String>,
    pub limits: SandboxLimits,
    pub cache_enabled: bool,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub kill_grace: Duration,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            worker_command: vec!["tmg-sandbox-worker".to_string()],
            limits: SandboxLimits::default(),
            cache_enabled: true,
            cache_capacity: crate::cache::DEFAULT_CAPACITY,
            cache_ttl: crate::cache::DEFAULT_TTL,
            kill_grace: crate::limits::DEFAULT_KILL_GRACE,
        }
    }
}

/// One code-execution request, with the allow-list already derived by the
/// caller (explicit tool names plus intent-search results).
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub context: Value,
    pub allowed_tools: Vec<String>,
    pub timeout: Option<Duration>,
    pub memory_limit: Option<u64>,
    pub pii_protection: Option<bool>,
    /// Hash over the allow-listed tools' schema versions; part of the
    /// cache key.
    pub schema_versions: String,
    pub speculative: bool,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, context: Value) -> Self {
        Self {
            code: code.into(),
            context,
            allowed_tools: Vec::new(),
            timeout: None,
            memory_limit: None,
            pii_protection: None,
            schema_versions: String::new(),
            speculative: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub value: Value,
    pub logs: Vec<String>,
    pub metrics: Value,
    pub cache_hit: bool,
}

pub struct SandboxRuntime {
    config: SandboxConfig,
    factory: Arc<dyn WorkerFactory>,
    cache: Option<ResultCache>,
    scrubber: PiiScrubber,
}

impl SandboxRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        let factory = Arc::new(ProcessWorkerFactory::new(config.worker_command.clone()));
        Self::with_factory(config, factory)
    }

    pub fn with_factory(config: SandboxConfig, factory: Arc<dyn WorkerFactory>) -> Self {
        let cache = config
            .cache_enabled
            .then(|| ResultCache::new(config.cache_capacity, config.cache_ttl));
        Self {
            config,
            factory,
            cache,
            scrubber: PiiScrubber::new(),
        }
    }

    pub async fn execute(
        &self,
        request: ExecutionRequest,
        handler: Arc<dyn BridgeToolHandler>,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionResult> {
        let shape = code::analyze(&request.code)?;
        let limits = self.config.limits.with_overrides(
            request.timeout,
            request.memory_limit,
            request.pii_protection,
        );

        let (context, reverse) = if limits.pii_protection {
            self.scrubber.scrub(&request.context)
        } else {
            (request.context.clone(), HashMap::new())
        };

        let cache_key = ResultCache::key(&request.code, &context, &request.schema_versions);
        if !request.speculative {
            if let Some(cache) = &self.cache {
                if let Some((value, logs)) = cache.get(&cache_key) {
                    debug!(key = %cache_key, "code execution cache hit");
                    return Ok(ExecutionResult {
                        value: PiiScrubber::restore(&value, &reverse),
                        logs,
                        metrics: json!({ "wall_ms": 0, "cache": "hit" }),
                        cache_hit: true,
                    });
                }
            }
        }

        let worker = self.factory.spawn(&limits).await?;
        let started = Instant::now();
        let exec_ctx = ctx.child_with_timeout(limits.timeout);
        let outcome = self
            .drive_worker(
                worker.as_ref(),
                &request,
                &context,
                &limits,
                shape,
                handler.as_ref(),
                &exec_ctx,
            )
            .await;
        // The worker is single-use; tear it down on every exit path.
        worker.terminate(self.config.kill_grace).await;

        let (value, logs) = outcome?;
        let restored = PiiScrubber::restore(&value, &reverse);
        if !request.speculative {
            if let Some(cache) = &self.cache {
                cache.put(cache_key, value, logs.clone());
            }
        }
        Ok(ExecutionResult {
            value: restored,
            logs,
            metrics: json!({ "wall_ms": started.elapsed().as_millis() as u64 }),
            cache_hit: false,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive_worker(
        &self,
        worker: &dyn WorkerChannel,
        request: &ExecutionRequest,
        context: &Value,
        limits: &SandboxLimits,
        shape: CodeShape,
        handler: &dyn BridgeToolHandler,
        ctx: &CallContext,
    ) -> GatewayResult<(Value, Vec<String>)> {
        let payload = json!({
            "code": request.code,
            "shape": match shape {
                CodeShape::Expression => "expression",
                CodeShape::Sequence => "sequence",
            },
            "context": context,
            "tools": request.allowed_tools,
            "limits": limits,
        });
        worker
            .send(&BridgeMessage::request(0, methods::EXECUTE, payload).encode())
            .await?;

        let allowed: HashSet<&str> = request.allowed_tools.iter().map(String::as_str).collect();
        let mut logs: Vec<String> = Vec::new();

        loop {
            let frame = match ctx.run(worker.recv()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return Err(GatewayError::sandbox_runtime(
                        "worker exited before returning a result",
                    ));
                }
                Err(e) if e.kind == ErrorKind::Timeout => {
                    return Err(GatewayError::timeout("code execution timed out"));
                }
                Err(e) => return Err(e),
            };

            match BridgeMessage::decode(&frame)? {
                BridgeMessage::RpcResponse {
                    id: 0,
                    success,
                    result,
                    error,
                } => {
                    return if success {
                        Ok((result.unwrap_or(Value::Null), logs))
                    } else {
                        Err(error
                            .map(|e| e.to_gateway_error())
                            .unwrap_or_else(|| {
                                GatewayError::sandbox_runtime("worker failed without detail")
                            }))
                    };
                }
                BridgeMessage::RpcResponse { id, .. } => {
                    debug!(id, "stray bridge response ignored");
                }
                BridgeMessage::RpcRequest {
                    id,
                    method,
                    payload,
                } => {
                    let reply = self
                        .handle_worker_request(&method, payload, &allowed, handler, context, ctx, &mut logs)
                        .await;
                    let message = match reply {
                        Ok(result) => BridgeMessage::ok(id, result),
                        Err(error) => BridgeMessage::err(id, error),
                    };
                    worker.send(&message.encode()).await?;
                }
                BridgeMessage::Notification { kind, payload } => {
                    if kind == "log" {
                        logs.push(
                            payload
                                .as_str()
                                .map(str::to_string)
                                .unwrap_or_else(|| payload.to_string()),
                        );
                    } else {
                        debug!(kind = %kind, "worker notification");
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_worker_request(
        &self,
        method: &str,
        payload: Value,
        allowed: &HashSet<&str>,
        handler: &dyn BridgeToolHandler,
        context: &Value,
        ctx: &CallContext,
        logs: &mut Vec<String>,
    ) -> Result<Value, WorkerError> {
        match method {
            methods::CALL_TOOL => {
                let Some(name) = payload.get("name").and_then(Value::as_str) else {
                    return Err(WorkerError {
                        kind: WorkerErrorKind::Runtime,
                        message: "call_tool payload is missing 'name'".to_string(),
                    });
                };
                if !allowed.contains(name) {
                    warn!(tool = %name, "sandbox tool call outside allow-list");
                    return Err(WorkerError {
                        kind: WorkerErrorKind::Permission,
                        message: format!("TOOL_NOT_ALLOWED: {}", name),
                    });
                }
                let arguments = payload.get("arguments").cloned().unwrap_or(json!({}));
                handler
                    .call_tool(name, arguments, ctx)
                    .await
                    .map_err(|e| WorkerError {
                        kind: WorkerErrorKind::Runtime,
                        message: e.to_string(),
                    })
            }
            methods::LOG => {
                logs.push(
                    payload
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| payload.to_string()),
                );
                Ok(Value::Null)
            }
            methods::READ_CONTEXT => Ok(context.clone()),
            other => Err(WorkerError {
                kind: WorkerErrorKind::Runtime,
                message: format!("unknown bridge method '{}'", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingFactory, EchoToolHandler, ScriptedWorkerFactory};

    fn runtime_with(factory: Arc<dyn WorkerFactory>) -> SandboxRuntime {
        SandboxRuntime::with_factory(SandboxConfig::default(), factory)
    }

    fn handler() -> Arc<dyn BridgeToolHandler> {
        Arc::new(EchoToolHandler::default())
    }

    #[tokio::test]
    async fn expression_returns_its_value() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new("just an expression", json!({}));
        let result = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert_eq!(result.value["echo"], "just an expression");
        assert!(!result.cache_hit);
    }

    #[tokio::test]
    async fn pii_is_scrubbed_and_restored() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new(
            "context.user.email",
            json!({"user": {"email": "alice@example.com"}}),
        );
        let result = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        // The worker only ever saw the token; the host restored it.
        assert_eq!(result.value, json!("alice@example.com"));
    }

    #[tokio::test]
    async fn pii_off_exposes_raw_values() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let mut request = ExecutionRequest::new(
            "context.user.email",
            json!({"user": {"email": "alice@example.com"}}),
        );
        request.pii_protection = Some(false);
        let result = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert_eq!(result.value, json!("alice@example.com"));
    }

    #[tokio::test]
    async fn worker_observes_token_not_raw_email() {
        let factory = Arc::new(ScriptedWorkerFactory::new());
        let runtime = runtime_with(Arc::clone(&factory) as Arc<dyn WorkerFactory>);
        let request = ExecutionRequest::new(
            "observe:user.email",
            json!({"user": {"email": "alice@example.com"}}),
        );
        runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        let seen = factory.observed().expect("worker recorded what it saw");
        assert_eq!(seen, json!("[EMAIL_1]"));
    }

    #[tokio::test]
    async fn tool_calls_outside_allow_list_are_denied() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new("call:fs:delete {}", json!({}));
        let err = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxPermission);
        assert!(err.message.contains("TOOL_NOT_ALLOWED"));
    }

    #[tokio::test]
    async fn allow_listed_tool_calls_reach_the_handler() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let mut request = ExecutionRequest::new("call:fs:read {\"path\":\"a.txt\"}", json!({}));
        request.allowed_tools = vec!["fs:read".to_string()];
        let result = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert_eq!(result.value["tool"], "fs:read");
        assert_eq!(result.value["arguments"]["path"], "a.txt");
    }

    #[tokio::test]
    async fn cache_hits_bypass_execution() {
        let counting = Arc::new(CountingFactory::new());
        let runtime = runtime_with(Arc::clone(&counting) as Arc<dyn WorkerFactory>);
        let request = ExecutionRequest::new("stable expression", json!({"x": 1}));

        let first = runtime
            .execute(request.clone(), handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert!(!first.cache_hit);
        let second = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.value, first.value);
        assert_eq!(counting.spawn_count(), 1);
    }

    #[tokio::test]
    async fn timeout_kills_the_worker() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let mut request = ExecutionRequest::new("sleep:10000", json!({}));
        request.timeout = Some(Duration::from_millis(50));
        let err = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn worker_crash_is_terminal() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new("crash:now", json!({}));
        let err = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxRuntime);
    }

    #[tokio::test]
    async fn runtime_errors_map_to_sandbox_runtime() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new("error:runtime", json!({}));
        let err = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::SandboxRuntime);
    }

    #[tokio::test]
    async fn invalid_auto_return_fails_before_spawn() {
        let counting = Arc::new(CountingFactory::new());
        let runtime = runtime_with(Arc::clone(&counting) as Arc<dyn WorkerFactory>);
        let request = ExecutionRequest::new("let x = 1;\nx + 1", json!({}));
        let err = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(counting.spawn_count(), 0);
    }

    #[tokio::test]
    async fn logs_are_collected() {
        let runtime = runtime_with(Arc::new(ScriptedWorkerFactory::new()));
        let request = ExecutionRequest::new("log:working on it", json!({}));
        let result = runtime
            .execute(request, handler(), &CallContext::unbounded())
            .await
            .unwrap();
        assert_eq!(result.logs, vec!["working on it"]);
    }
}
