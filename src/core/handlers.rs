//! Meta-tool handlers: the gateway's public tool surface.
//!
//! Domain failures never become JSON-RPC errors here; they come back as
//! tool results embedding `{status: "error", error, code}` so callers keep
//! workflow correlation.

use serde_json::{json, Map, Value};
use std::time::Duration;

use dagrun::{
    CodeRequest, DependencyDecision, ExecutionOutcome, ResumeInput, SubmitOptions, SuggestionSource,
    WorkflowMode,
};
use tmg_discovery::SearchOptions;
use tmg_wire::mcp::{CallToolResult, WireTool};
use tmg_wire::{CallContext, GatewayError, GatewayResult};

use super::gateway::Gateway;

/// Suggested plans below this confidence are proposed, not executed.
const EXECUTE_CONFIDENCE: f64 = 0.5;

impl Gateway {
    /// Descriptors for the gateway's own tools, self-reported in
    /// `tools/list` ahead of the proxied upstream catalog.
    pub fn meta_tools() -> Vec<WireTool> {
        fn tool(name: &str, description: &str, schema: Value) -> WireTool {
            WireTool {
                name: name.to_string(),
                title: None,
                description: Some(description.to_string()),
                input_schema: schema,
            }
        }

        vec![
            tool(
                "search_tools",
                "Semantic search over the tool catalog with graph-aware ranking",
                json!({
                    "type": "object",
                    "properties": {
                        "query": {"type": "string"},
                        "limit": {"type": "integer", "default": 8},
                        "include_related": {"type": "boolean", "default": false},
                        "context_tools": {"type": "array", "items": {"type": "string"}}
                    },
                    "required": ["query"]
                }),
            ),
            tool(
                "search_capabilities",
                "Search learned capabilities by intent; optionally include a suggested plan",
                json!({
                    "type": "object",
                    "properties": {
                        "intent": {"type": "string"},
                        "include_suggestions": {"type": "boolean", "default": false}
                    },
                    "required": ["intent"]
                }),
            ),
            tool(
                "execute_dag",
                "Execute a workflow: an explicit task DAG or a plan suggested from an intent",
                json!({
                    "type": "object",
                    "properties": {
                        "intent": {"type": "string"},
                        "workflow": {"type": "object"},
                        "per_layer_validation": {"type": "boolean", "default": false},
                        "continue_on_error": {"type": "boolean", "default": false},
                        "deadline_ms": {"type": "integer"}
                    }
                }),
            ),
            tool(
                "execute_code",
                "Run code in the sandbox with an audited tool bridge",
                json!({
                    "type": "object",
                    "properties": {
                        "code": {"type": "string"},
                        "intent": {"type": "string"},
                        "context": {"type": "object"},
                        "tools": {"type": "array", "items": {"type": "string"}},
                        "timeout_ms": {"type": "integer"},
                        "pii_protection": {"type": "boolean"}
                    },
                    "required": ["code"]
                }),
            ),
            tool(
                "continue",
                "Resume a paused workflow",
                json!({
                    "type": "object",
                    "properties": {
                        "workflow_id": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["workflow_id"]
                }),
            ),
            tool(
                "abort",
                "Terminate a paused workflow",
                json!({
                    "type": "object",
                    "properties": {
                        "workflow_id": {"type": "string"},
                        "reason": {"type": "string"}
                    },
                    "required": ["workflow_id", "reason"]
                }),
            ),
            tool(
                "replan",
                "Cancel the paused frontier and splice a new plan fragment",
                json!({
                    "type": "object",
                    "properties": {
                        "workflow_id": {"type": "string"},
                        "new_requirement": {"type": "string"}
                    },
                    "required": ["workflow_id", "new_requirement"]
                }),
            ),
            tool(
                "approval_response",
                "Answer a pending approval: checkpoint (approved) or dependency (decision)",
                json!({
                    "type": "object",
                    "properties": {
                        "workflow_id": {"type": "string"},
                        "checkpoint_id": {"type": "string"},
                        "approved": {"type": "boolean"},
                        "feedback": {"type": "string"},
                        "decision": {
                            "type": "string",
                            "enum": ["approve_once", "approve_always", "reject"]
                        }
                    },
                    "required": ["workflow_id"]
                }),
            ),
            tool(
                "gateway_status",
                "Upstream, registry, graph and pending-workflow counters",
                json!({"type": "object", "properties": {}}),
            ),
        ]
    }

    /// Dispatch one `tools/call`. Names containing a colon route straight
    /// to the upstream manager; everything else is a meta-tool.
    pub async fn handle_tool_call(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        ctx: &CallContext,
    ) -> CallToolResult {
        let args = Value::Object(arguments.clone().unwrap_or_default());
        let outcome = match name {
            "search_tools" => self.handle_search_tools(&args, ctx).await,
            "search_capabilities" => self.handle_search_capabilities(&args).await,
            "execute_dag" => self.handle_execute_dag(&args, ctx).await,
            "execute_code" => self.handle_execute_code(&args, ctx).await,
            "continue" => self.handle_continue(&args, ctx).await,
            "abort" => self.handle_abort(&args, ctx).await,
            "replan" => self.handle_replan(&args, ctx).await,
            "approval_response" => self.handle_approval_response(&args, ctx).await,
            "gateway_status" => Ok(self.status()),
            _ if name.contains(':') => return self.handle_proxy(name, arguments, ctx).await,
            other => Err(GatewayError::validation(format!(
                "unknown tool '{}'",
                other
            ))),
        };
        match outcome {
            Ok(payload) => CallToolResult::json(payload),
            Err(error) => error_result(&error, None),
        }
    }

    async fn handle_proxy(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        ctx: &CallContext,
    ) -> CallToolResult {
        let Some(qualified) = tmg_discovery::QualifiedName::parse(name) else {
            return error_result(
                &GatewayError::validation(format!("'{}' is not a server:tool name", name)),
                None,
            );
        };
        match self
            .manager
            .call(qualified.server(), qualified.tool(), arguments, ctx)
            .await
        {
            Ok(result) => result,
            Err(error) => error_result(&error, None),
        }
    }

    async fn handle_search_tools(&self, args: &Value, _ctx: &CallContext) -> GatewayResult<Value> {
        let query = require_str(args, "query")?;
        let opts = SearchOptions {
            limit: args.get("limit").and_then(Value::as_u64).unwrap_or(8) as usize,
            include_related: args
                .get("include_related")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            context_tools: string_list(args.get("context_tools")),
            kind: None,
            weights: self.config.search_weights(),
        };
        let hits = self.registry.search(query, &opts).await?;
        Ok(json!({ "status": "ok", "results": hits }))
    }

    async fn handle_search_capabilities(&self, args: &Value) -> GatewayResult<Value> {
        let intent = require_str(args, "intent")?;
        let hits = self.registry.search_capabilities(intent, 5).await?;
        let mut payload = json!({ "status": "ok", "results": hits });
        if args
            .get("include_suggestions")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            match self.suggester.suggest(intent).await {
                Ok(plan) => {
                    payload["suggestion"] = json!({
                        "tasks": plan.tasks,
                        "confidence": plan.confidence,
                        "source": match plan.source {
                            SuggestionSource::Capability { id } => json!({"capability": id}),
                            SuggestionSource::Synthesized => json!("synthesized"),
                        },
                    });
                }
                Err(e) => payload["suggestion_error"] = json!(e.message),
            }
        }
        Ok(payload)
    }

    async fn handle_execute_dag(&self, args: &Value, ctx: &CallContext) -> GatewayResult<Value> {
        let options = SubmitOptions {
            per_layer_validation: args
                .get("per_layer_validation")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            continue_on_error: args
                .get("continue_on_error")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            parent_request_id: args
                .get("request_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            deadline: args
                .get("deadline_ms")
                .and_then(Value::as_u64)
                .map(Duration::from_millis),
        };

        let outcome = if let Some(workflow) = args.get("workflow") {
            self.engine.submit_plan(workflow, options, ctx).await?
        } else if let Some(intent) = args.get("intent").and_then(Value::as_str) {
            let plan = self.suggester.suggest(intent).await?;
            if plan.confidence < EXECUTE_CONFIDENCE {
                return Ok(json!({
                    "status": "proposed_plan",
                    "confidence": plan.confidence,
                    "tasks": plan.tasks,
                }));
            }
            self.engine.submit(plan.tasks, options, ctx).await?
        } else {
            return Err(GatewayError::validation(
                "execute_dag requires either `intent` or `workflow`",
            ));
        };
        Ok(self.outcome_payload(outcome))
    }

    async fn handle_execute_code(&self, args: &Value, ctx: &CallContext) -> GatewayResult<Value> {
        let code = require_str(args, "code")?;
        let mut sandbox_overrides = Map::new();
        if let Some(tools) = args.get("tools") {
            sandbox_overrides.insert("tools".to_string(), tools.clone());
        }
        if let Some(timeout) = args.get("timeout_ms") {
            sandbox_overrides.insert("timeout_ms".to_string(), timeout.clone());
        }
        if let Some(pii) = args.get("pii_protection") {
            sandbox_overrides.insert("pii_protection".to_string(), pii.clone());
        }
        let request = CodeRequest {
            code: code.to_string(),
            intent: args
                .get("intent")
                .and_then(Value::as_str)
                .map(str::to_string),
            context: args.get("context").cloned().unwrap_or_else(|| json!({})),
            sandbox: (!sandbox_overrides.is_empty()).then(|| Value::Object(sandbox_overrides)),
            speculative: false,
        };
        let result = self.dispatcher.run_code(&request, ctx).await?;
        Ok(json!({
            "status": "ok",
            "value": result.value,
            "logs": result.logs,
            "metrics": result.metrics,
            "cache_hit": result.cache_hit,
        }))
    }

    async fn handle_continue(&self, args: &Value, ctx: &CallContext) -> GatewayResult<Value> {
        let workflow_id = require_str(args, "workflow_id")?;
        let input = ResumeInput::Continue {
            reason: args
                .get("reason")
                .and_then(Value::as_str)
                .map(str::to_string),
        };
        match self.engine.resume(workflow_id, input, ctx).await {
            Ok(outcome) => Ok(self.outcome_payload(outcome)),
            Err(error) => Ok(error.to_payload(Some(workflow_id))),
        }
    }

    async fn handle_abort(&self, args: &Value, ctx: &CallContext) -> GatewayResult<Value> {
        let workflow_id = require_str(args, "workflow_id")?;
        let reason = require_str(args, "reason")?;
        match self.engine.abort(workflow_id, reason, ctx).await {
            Ok(result) => Ok(json!({
                "status": "aborted",
                "workflow_id": result.workflow_id,
                "messages": result.messages,
            })),
            Err(error) => Ok(error.to_payload(Some(workflow_id))),
        }
    }

    async fn handle_replan(&self, args: &Value, ctx: &CallContext) -> GatewayResult<Value> {
        let workflow_id = require_str(args, "workflow_id")?;
        let requirement = require_str(args, "new_requirement")?;
        let fragment = self.suggester.suggest(requirement).await?;
        match self
            .engine
            .replan(workflow_id, fragment.tasks, ctx)
            .await
        {
            Ok(outcome) => Ok(self.outcome_payload(outcome)),
            Err(error) => Ok(error.to_payload(Some(workflow_id))),
        }
    }

    async fn handle_approval_response(
        &self,
        args: &Value,
        ctx: &CallContext,
    ) -> GatewayResult<Value> {
        let workflow_id = require_str(args, "workflow_id")?;
        let input = if let Some(decision) = args.get("decision").and_then(Value::as_str) {
            let decision = match decision {
                "approve_once" => DependencyDecision::ApproveOnce,
                "approve_always" => DependencyDecision::ApproveAlways,
                "reject" => DependencyDecision::Reject,
                other => {
                    return Err(GatewayError::validation(format!(
                        "unknown decision '{}'",
                        other
                    )));
                }
            };
            ResumeInput::Dependency { decision }
        } else {
            let approved = args
                .get("approved")
                .and_then(Value::as_bool)
                .ok_or_else(|| {
                    GatewayError::validation("approval_response requires `approved` or `decision`")
                })?;
            ResumeInput::Checkpoint {
                checkpoint_id: args
                    .get("checkpoint_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                approved,
                feedback: args
                    .get("feedback")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        };
        match self.engine.resume(workflow_id, input, ctx).await {
            Ok(outcome) => Ok(self.outcome_payload(outcome)),
            Err(error) => Ok(error.to_payload(Some(workflow_id))),
        }
    }

    /// Map an engine outcome into the wire payload. Successful completions
    /// fold their trace into the knowledge graph here.
    pub(crate) fn outcome_payload(&self, outcome: ExecutionOutcome) -> Value {
        match outcome {
            ExecutionOutcome::Completed(result) => {
                if let Some(fold) = &result.fold {
                    self.graph.fold_trace(fold);
                }
                let task_records = serde_json::to_value(&result.records).unwrap_or(Value::Null);
                match result.mode {
                    WorkflowMode::Completed => json!({
                        "status": "completed",
                        "workflow_id": result.workflow_id,
                        "output": result.output,
                        "executed_path": result.executed_path,
                        "task_records": task_records,
                    }),
                    WorkflowMode::Aborted => json!({
                        "status": "aborted",
                        "workflow_id": result.workflow_id,
                        "messages": result.messages,
                        "task_records": task_records,
                    }),
                    _ => {
                        let (code, message) = result
                            .first_error()
                            .map(|e| (e.kind.as_str(), e.message.clone()))
                            .unwrap_or(("INTERNAL", "workflow failed".to_string()));
                        json!({
                            "status": "error",
                            "code": code,
                            "error": message,
                            "workflow_id": result.workflow_id,
                            "task_records": task_records,
                        })
                    }
                }
            }
            ExecutionOutcome::Paused(ticket) => json!({
                "status": "approval_required",
                "approval_type": ticket.approval_type,
                "workflow_id": ticket.workflow_id,
                "context": ticket.context,
                "options": ticket.options,
            }),
        }
    }
}

fn error_result(error: &GatewayError, workflow_id: Option<&str>) -> CallToolResult {
    let mut result = CallToolResult::json(error.to_payload(workflow_id));
    result.is_error = Some(true);
    result
}

fn require_str<'a>(args: &'a Value, key: &str) -> GatewayResult<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation(format!("missing required field `{}`", key)))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
