//! Subsystem wiring.
//!
//! `Gateway` owns the registry, knowledge graph, upstream manager, DAG
//! engine, sandbox runtime and suggester, and is the one place where the
//! engine's dispatch seam and the sandbox's tool bridge are bound to real
//! implementations.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use dagrun::{CodeRequest, DagEngine, EngineEvent, SuggestConfig, Suggester, TaskDispatcher};
use tmg_discovery::descriptor::DescriptorSink;
use tmg_discovery::{HashingEmbedder, InMemoryVectorStore, KnowledgeGraph, Registry, SearchOptions};
use tmg_sandbox::{
    BridgeToolHandler, ExecutionRequest, ExecutionResult, SandboxRuntime, WorkerFactory,
};
use tmg_upstream::manager::{DefaultTransportFactory, TransportFactory};
use tmg_upstream::UpstreamManager;
use tmg_wire::mcp::methods;
use tmg_wire::{CallContext, GatewayError, GatewayResult};

use crate::config::GatewayConfig;

/// Allow-list gate for dependency approvals. With `require` off (the
/// default) every subject is implicitly approved.
pub struct ApprovalPolicy {
    require: bool,
    allowed: parking_lot::RwLock<HashSet<String>>,
}

impl ApprovalPolicy {
    pub fn new(require: bool, initial: Vec<String>) -> Self {
        Self {
            require,
            allowed: parking_lot::RwLock::new(initial.into_iter().collect()),
        }
    }

    pub fn needs_approval(&self, subject: &str) -> Option<String> {
        if !self.require || self.allowed.read().contains(subject) {
            return None;
        }
        Some(format!("'{}' is not on the approved tool list", subject))
    }

    /// Persist an approve-always decision.
    pub fn allow(&self, subject: &str) {
        self.allowed.write().insert(subject.to_string());
    }
}

/// Invoke an upstream tool addressed as `server:tool` and convert the MCP
/// result into a plain JSON value. Tool-reported failures surface as
/// `UPSTREAM_TOOL_ERROR` with the upstream's message verbatim.
async fn call_upstream(
    manager: &UpstreamManager,
    qualified: &str,
    arguments: Value,
    ctx: &CallContext,
) -> GatewayResult<Value> {
    let name = tmg_discovery::QualifiedName::parse(qualified).ok_or_else(|| {
        GatewayError::validation(format!("'{}' is not a server:tool name", qualified))
    })?;
    let arguments = match arguments {
        Value::Null => None,
        Value::Object(map) => Some(map),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            Some(map)
        }
    };
    let result = manager
        .call(name.server(), name.tool(), arguments, ctx)
        .await?;
    if result.reported_error() {
        let message = result
            .content
            .first()
            .and_then(|item| item.as_text())
            .unwrap_or("upstream tool reported an error");
        return Err(GatewayError::upstream_tool(message));
    }
    Ok(result.to_value())
}

/// Sandbox-side view of the dispatch table: workers may only reach tools
/// the runtime has allow-listed, and those calls land here.
pub struct ToolBridge {
    manager: Arc<UpstreamManager>,
}

#[async_trait]
impl BridgeToolHandler for ToolBridge {
    async fn call_tool(
        &self,
        qualified: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> GatewayResult<Value> {
        call_upstream(&self.manager, qualified, arguments, ctx).await
    }
}

/// Binds the engine's task kinds to the upstream manager, the sandbox and
/// the registry.
pub struct Dispatcher {
    manager: Arc<UpstreamManager>,
    registry: Arc<Registry>,
    sandbox: Arc<SandboxRuntime>,
    approvals: Arc<ApprovalPolicy>,
    bridge: Arc<ToolBridge>,
    intent_search_k: usize,
}

impl Dispatcher {
    /// Full code-execution path: derive the tool allow-list (explicit names
    /// plus intent search), compute schema versions, run the sandbox.
    pub async fn run_code(
        &self,
        request: &CodeRequest,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionResult> {
        let mut allowed: Vec<String> = Vec::new();
        let mut timeout = None;
        let mut memory_limit = None;
        let mut pii_protection = None;

        if let Some(overrides) = &request.sandbox {
            if let Some(tools) = overrides.get("tools").and_then(Value::as_array) {
                allowed.extend(
                    tools
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string),
                );
            }
            timeout = overrides
                .get("timeout_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis);
            memory_limit = overrides.get("memory_limit").and_then(Value::as_u64);
            pii_protection = overrides.get("pii_protection").and_then(Value::as_bool);
        }

        if let Some(intent) = &request.intent {
            let opts = SearchOptions {
                limit: self.intent_search_k,
                kind: Some(tmg_discovery::EntityKind::Tool),
                ..SearchOptions::default()
            };
            match self.registry.search(intent, &opts).await {
                Ok(hits) => {
                    for hit in hits {
                        if !allowed.contains(&hit.id) {
                            allowed.push(hit.id);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "intent search for sandbox allow-list failed"),
            }
        }

        let schema_versions = self.registry.schema_version_hash(&allowed);
        let exec = ExecutionRequest {
            code: request.code.clone(),
            context: request.context.clone(),
            allowed_tools: allowed,
            timeout,
            memory_limit,
            pii_protection,
            schema_versions,
            speculative: request.speculative,
        };
        self.sandbox
            .execute(exec, Arc::clone(&self.bridge) as Arc<dyn BridgeToolHandler>, ctx)
            .await
    }
}

#[async_trait]
impl TaskDispatcher for Dispatcher {
    async fn call_tool(
        &self,
        target: &str,
        arguments: Value,
        ctx: &CallContext,
    ) -> GatewayResult<Value> {
        call_upstream(&self.manager, target, arguments, ctx).await
    }

    async fn execute_code(&self, request: CodeRequest, ctx: &CallContext) -> GatewayResult<Value> {
        let result = self.run_code(&request, ctx).await?;
        Ok(result.value)
    }

    async fn expand_capability(&self, capability: &str) -> GatewayResult<Value> {
        self.registry
            .expand_capability(capability)
            .ok_or_else(|| GatewayError::validation(format!("unknown capability '{}'", capability)))
    }

    fn needs_approval(&self, subject: &str) -> Option<String> {
        self.approvals.needs_approval(subject)
    }

    fn approve_always(&self, subject: &str) {
        self.approvals.allow(subject);
    }

    fn record_capability_outcome(&self, capability: &str, success: bool) {
        self.registry.record_capability_use(capability, success);
    }
}

pub struct Gateway {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: Arc<Registry>,
    pub(crate) graph: Arc<KnowledgeGraph>,
    pub(crate) manager: Arc<UpstreamManager>,
    pub(crate) engine: Arc<DagEngine>,
    pub(crate) suggester: Suggester,
    pub(crate) dispatcher: Arc<Dispatcher>,
}

impl Gateway {
    pub async fn start(config: GatewayConfig) -> GatewayResult<Arc<Self>> {
        Self::start_with(config, Arc::new(DefaultTransportFactory), None).await
    }

    /// Start with injected factories; the test suites run real wiring over
    /// in-process upstreams and scripted workers.
    pub async fn start_with(
        config: GatewayConfig,
        transports: Arc<dyn TransportFactory>,
        workers: Option<Arc<dyn WorkerFactory>>,
    ) -> GatewayResult<Arc<Self>> {
        config.validate()?;

        let graph = Arc::new(KnowledgeGraph::new(config.graph.decay_lambda));
        let registry = Arc::new(Registry::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::clone(&graph),
        ));

        let manager = UpstreamManager::start_with_factory(
            config.upstream_config(),
            Arc::clone(&registry) as Arc<dyn DescriptorSink>,
            transports,
        )
        .await?;

        let sandbox = match workers {
            Some(factory) => Arc::new(SandboxRuntime::with_factory(config.sandbox_config(), factory)),
            None => Arc::new(SandboxRuntime::new(config.sandbox_config())),
        };
        let approvals = Arc::new(ApprovalPolicy::new(
            config.approvals.require_approval,
            config.approvals.allow.clone(),
        ));
        let bridge = Arc::new(ToolBridge {
            manager: Arc::clone(&manager),
        });
        let dispatcher = Arc::new(Dispatcher {
            manager: Arc::clone(&manager),
            registry: Arc::clone(&registry),
            sandbox,
            approvals,
            bridge,
            intent_search_k: config.sandbox.intent_search_k,
        });
        let engine = DagEngine::new(
            Arc::clone(&dispatcher) as Arc<dyn TaskDispatcher>,
            config.engine_config(),
        );
        let suggester = Suggester::new(Arc::clone(&registry), SuggestConfig::default());

        let gateway = Arc::new(Self {
            config,
            registry,
            graph,
            manager,
            engine,
            suggester,
            dispatcher,
        });
        gateway.spawn_notification_pump();
        gateway.spawn_trace_sink();
        info!("gateway started");
        Ok(gateway)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<DagEngine> {
        &self.engine
    }

    pub fn manager(&self) -> &Arc<UpstreamManager> {
        &self.manager
    }

    /// Engine event stream for SSE consumers and observability sinks.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.engine.subscribe()
    }

    pub async fn shutdown(&self) {
        self.engine.shutdown();
        self.manager.shutdown().await;
        info!("gateway stopped");
    }

    /// Forward upstream notifications: tool-list changes trigger a refresh,
    /// everything else is logged.
    fn spawn_notification_pump(self: &Arc<Self>) {
        let Some(mut notifications) = self.manager.take_notifications() else {
            return;
        };
        let manager = Arc::clone(&self.manager);
        tokio::spawn(async move {
            while let Some((server, notification)) = notifications.recv().await {
                if notification.method == methods::NOTIF_TOOLS_CHANGED {
                    info!(server = %server, "upstream tool list changed");
                    if let Err(e) = manager.refresh_server(&server).await {
                        warn!(server = %server, error = %e, "refresh after change failed");
                    }
                } else {
                    debug!(server = %server, method = %notification.method, "upstream notification");
                }
            }
        });
    }

    /// Observability hook: trace events go to the structured log; a
    /// persistent trace store subscribes to the same stream externally.
    fn spawn_trace_sink(self: &Arc<Self>) {
        let mut events = self.engine.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(EngineEvent::Trace(event)) => {
                        debug!(
                            kind = ?event.kind,
                            root = %event.root_id,
                            trace_target = %event.target,
                            status = %event.status,
                            duration_ms = event.duration_ms,
                            "trace"
                        );
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "trace sink lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    pub fn status(&self) -> Value {
        let upstream = self.manager.stats();
        let (tools, capabilities) = self.registry.counts();
        json!({
            "upstream": {
                "servers": upstream.server_count,
                "healthy": upstream.healthy_count,
                "tools": upstream.tool_count,
            },
            "registry": { "tools": tools, "capabilities": capabilities },
            "graph": {
                "nodes": self.graph.node_count(),
                "edges": self.graph.edge_count(),
            },
            "pending_workflows": self.engine.pending_count(),
        })
    }
}
