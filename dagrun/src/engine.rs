//! The layered scheduler.
//!
//! Runs one layer at a time with bounded parallelism. Within a layer,
//! inputs are resolved against completed outputs, tasks dispatch through
//! the `TaskDispatcher` seam with per-task retry budgets, and failures
//! either stop the workflow (fail-fast, the default) or skip the failed
//! task's dependents (`continue_on_error`). Checkpoints and unapproved
//! dependencies pause the workflow into the pending store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tmg_discovery::graph::TraceFold;
use tmg_wire::{CallContext, ErrorKind, GatewayError, GatewayResult};

use crate::dispatch::{CodeRequest, TaskDispatcher};
use crate::pending::{PauseKind, PendingRecord, PendingStore};
use crate::plan::CompiledPlan;
use crate::reference::{evaluate_guard, resolve_arguments};
use crate::speculation::{SpeculationConfig, SpeculationPool};
use crate::state::{CheckpointDecision, WorkflowMode, WorkflowState};
use crate::task::{parse_task_specs, TaskKind, TaskRecord, TaskSpec, TaskStatus};
use crate::trace::{EngineEvent, TraceEvent, TraceKind};

const SWEEP_INTERVAL: Duration = Duration::from_secs(30);
const EVENT_BUFFER: usize = 256;

/// Per-task retry schedule for retryable errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let raw = (self.base_backoff.as_millis() as u64)
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff.as_millis() as u64);
        let jitter = (raw as f64 * 0.1 * rand::random::<f64>()) as u64;
        Duration::from_millis(raw + jitter)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Parallelism cap per layer.
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    /// Pending TTL for checkpoints and validation gates.
    pub approval_ttl: Duration,
    /// Pending TTL for dependency approvals.
    pub dependency_ttl: Duration,
    pub speculation: SpeculationConfig,
    pub max_dag_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 10,
            retry: RetryPolicy::default(),
            approval_ttl: crate::pending::DEFAULT_APPROVAL_TTL,
            dependency_ttl: crate::pending::DEFAULT_DEPENDENCY_TTL,
            speculation: SpeculationConfig::default(),
            max_dag_depth: 4,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub per_layer_validation: bool,
    pub continue_on_error: bool,
    pub parent_request_id: Option<String>,
    /// Workflow-wide deadline; unbounded when `None`.
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum ResumeInput {
    Continue {
        reason: Option<String>,
    },
    Abort {
        reason: String,
    },
    Checkpoint {
        checkpoint_id: String,
        approved: bool,
        feedback: Option<String>,
    },
    Dependency {
        decision: DependencyDecision,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyDecision {
    ApproveOnce,
    ApproveAlways,
    Reject,
}

/// `approval_required` payload handed back to the caller on pause.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PauseTicket {
    pub workflow_id: String,
    pub approval_type: String,
    pub context: Value,
    pub options: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub mode: WorkflowMode,
    /// Terminal output: single sink's output, or a sink-keyed map.
    pub output: Value,
    pub records: std::collections::HashMap<String, TaskRecord>,
    pub executed_path: Vec<String>,
    pub messages: Vec<String>,
    pub trace: Vec<TraceEvent>,
    /// Graph deltas; present only for successful completions.
    pub fold: Option<TraceFold>,
}

impl WorkflowResult {
    /// First per-task error, for surfacing failed workflows.
    pub fn first_error(&self) -> Option<&GatewayError> {
        self.records.values().find_map(|record| record.error.as_ref())
    }
}

#[derive(Debug)]
pub enum ExecutionOutcome {
    Completed(Box<WorkflowResult>),
    Paused(PauseTicket),
}

pub struct DagEngine {
    dispatcher: Arc<dyn TaskDispatcher>,
    config: EngineConfig,
    pending: Arc<PendingStore>,
    events: broadcast::Sender<EngineEvent>,
    shutdown: CancellationToken,
}

impl DagEngine {
    pub fn new(dispatcher: Arc<dyn TaskDispatcher>, config: EngineConfig) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let engine = Arc::new(Self {
            dispatcher,
            config,
            pending: Arc::new(PendingStore::new()),
            events,
            shutdown: CancellationToken::new(),
        });
        Arc::clone(&engine).spawn_sweeper();
        engine
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Submit task declarations for execution.
    pub async fn submit(
        self: &Arc<Self>,
        specs: Vec<TaskSpec>,
        options: SubmitOptions,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionOutcome> {
        let plan = CompiledPlan::compile(specs)?;
        let mut wf = WorkflowState::new(Uuid::new_v4().to_string(), plan);
        wf.per_layer_validation = options.per_layer_validation;
        wf.continue_on_error = options.continue_on_error;
        wf.parent_request_id = options.parent_request_id;

        let run_ctx = match options.deadline {
            Some(deadline) => ctx.child_with_timeout(deadline),
            None => ctx.child(),
        };
        let start = TraceEvent::new(&wf.id, TraceKind::ExecStart, "workflow");
        self.push_trace(&mut wf, start);
        self.run_inner(wf, &run_ctx, 0).await
    }

    /// Submit a plan blob (`{"tasks": [...]}` or a bare array).
    pub async fn submit_plan(
        self: &Arc<Self>,
        plan_blob: &Value,
        options: SubmitOptions,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionOutcome> {
        self.submit(parse_task_specs(plan_blob)?, options, ctx).await
    }

    /// Resume a paused workflow with caller input.
    pub async fn resume(
        self: &Arc<Self>,
        workflow_id: &str,
        input: ResumeInput,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionOutcome> {
        let PendingRecord {
            state: mut wf,
            pause,
            parent_request_id,
            checkpoint_id,
            expires_at,
            created_at,
        } = self.pending.take(workflow_id)?;

        if let ResumeInput::Abort { reason } = &input {
            wf.log(format!("aborted: {}", reason));
            self.cancel_unfinished(&mut wf);
            return Ok(self.finish(wf, WorkflowMode::Aborted));
        }

        match (pause, input) {
            (PauseKind::PerLayerValidation { .. }, ResumeInput::Continue { reason }) => {
                if let Some(reason) = reason {
                    wf.log(reason);
                }
                wf.mode = WorkflowMode::Running;
                self.run_inner(wf, ctx, 0).await
            }
            (
                PauseKind::Checkpoint { task_id, .. },
                ResumeInput::Checkpoint {
                    checkpoint_id: given,
                    approved,
                    feedback,
                },
            ) if given.is_empty() || given == task_id => {
                wf.checkpoint_decisions.insert(
                    task_id.clone(),
                    CheckpointDecision {
                        approved,
                        feedback: feedback.clone(),
                    },
                );
                if approved {
                    wf.mode = WorkflowMode::Running;
                    self.run_inner(wf, ctx, 0).await
                } else {
                    let reason =
                        feedback.unwrap_or_else(|| "checkpoint rejected".to_string());
                    wf.log(format!("checkpoint '{}' rejected: {}", task_id, reason));
                    self.cancel_unfinished(&mut wf);
                    Ok(self.finish(wf, WorkflowMode::Aborted))
                }
            }
            (
                PauseKind::Dependency {
                    task_id, subject, ..
                },
                ResumeInput::Dependency { decision },
            ) => match decision {
                DependencyDecision::ApproveOnce | DependencyDecision::ApproveAlways => {
                    if decision == DependencyDecision::ApproveAlways {
                        self.dispatcher.approve_always(&subject);
                    }
                    wf.approved_dependencies.insert(subject);
                    wf.mode = WorkflowMode::Running;
                    self.run_inner(wf, ctx, 0).await
                }
                DependencyDecision::Reject => {
                    let err =
                        GatewayError::dependency(format!("'{}' rejected by operator", subject));
                    wf.record(
                        &task_id,
                        TaskRecord {
                            status: TaskStatus::Failed,
                            output: None,
                            error: Some(err),
                            duration_ms: 0,
                            attempts: 0,
                        },
                    );
                    if wf.continue_on_error {
                        for dependent in wf.plan.dependents_closure(&task_id) {
                            self.set_status_if_open(&mut wf, &dependent, TaskStatus::Skipped);
                        }
                        wf.mode = WorkflowMode::Running;
                        self.run_inner(wf, ctx, 0).await
                    } else {
                        Ok(self.finish(wf, WorkflowMode::Failed))
                    }
                }
            },
            (pause, _input) => {
                // Put the record back untouched before rejecting.
                self.pending.insert(
                    workflow_id.to_string(),
                    PendingRecord {
                        state: wf,
                        pause,
                        parent_request_id,
                        checkpoint_id,
                        expires_at,
                        created_at,
                    },
                );
                Err(GatewayError::validation(
                    "resume input does not match the workflow's pause kind",
                ))
            }
        }
    }

    /// Terminate a paused workflow.
    pub async fn abort(
        self: &Arc<Self>,
        workflow_id: &str,
        reason: &str,
        ctx: &CallContext,
    ) -> GatewayResult<Box<WorkflowResult>> {
        match self
            .resume(
                workflow_id,
                ResumeInput::Abort {
                    reason: reason.to_string(),
                },
                ctx,
            )
            .await?
        {
            ExecutionOutcome::Completed(result) => Ok(result),
            ExecutionOutcome::Paused(_) => {
                Err(GatewayError::internal("abort cannot re-pause a workflow"))
            }
        }
    }

    /// Splice a fresh fragment at the paused workflow's frontier: the
    /// current layer's unfinished tasks are cancelled, later tasks whose
    /// dependency chains survive are carried over, and completed outputs
    /// stay addressable.
    pub async fn replan(
        self: &Arc<Self>,
        workflow_id: &str,
        fragment: Vec<TaskSpec>,
        ctx: &CallContext,
    ) -> GatewayResult<ExecutionOutcome> {
        let PendingRecord { state: mut wf, .. } = self.pending.take(workflow_id)?;

        if let Some(layer) = wf.plan.layers.get(wf.layer_index).cloned() {
            for task_id in layer {
                self.set_status_if_open(&mut wf, &task_id, TaskStatus::Cancelled);
            }
        }

        let completed: HashSet<String> = wf.outputs.keys().cloned().collect();
        let mut carried_ids: HashSet<String> =
            fragment.iter().map(|spec| spec.id.clone()).collect();
        let mut carried: Vec<TaskSpec> = Vec::new();
        loop {
            let mut changed = false;
            for task in wf.plan.tasks.values() {
                if carried_ids.contains(&task.id) || wf.status(&task.id) != TaskStatus::Pending {
                    continue;
                }
                let chain_intact = task
                    .depends_on
                    .iter()
                    .all(|dep| completed.contains(dep) || carried_ids.contains(dep));
                if chain_intact {
                    carried_ids.insert(task.id.clone());
                    carried.push(task.clone());
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
        // Pending tasks stranded behind cancelled work are cancelled too.
        let stranded: Vec<String> = wf
            .plan
            .tasks
            .keys()
            .filter(|id| wf.status(id) == TaskStatus::Pending && !carried_ids.contains(*id))
            .cloned()
            .collect();
        for task_id in stranded {
            self.set_status_if_open(&mut wf, &task_id, TaskStatus::Cancelled);
        }

        let fragment_count = fragment.len();
        let mut specs = carried;
        specs.extend(fragment);
        let plan = CompiledPlan::compile_with_completed(specs, &completed)?;
        for task_id in plan.tasks.keys() {
            wf.records
                .entry(task_id.clone())
                .or_insert_with(TaskRecord::pending);
        }
        wf.plan = plan;
        wf.layer_index = 0;
        wf.mode = WorkflowMode::Running;
        wf.log(format!("replanned with {} new task(s)", fragment_count));
        self.run_inner(wf, ctx, 0).await
    }

    // ------------------------------------------------------------------
    // Core loop
    // ------------------------------------------------------------------

    async fn run_inner(
        self: &Arc<Self>,
        mut wf: WorkflowState,
        ctx: &CallContext,
        depth: usize,
    ) -> GatewayResult<ExecutionOutcome> {
        let pool = Arc::new(SpeculationPool::new());
        loop {
            if wf.layer_index >= wf.plan.layers.len() {
                return Ok(self.finish(wf, WorkflowMode::Completed));
            }
            if let Err(e) = ctx.check() {
                wf.log(e.to_string());
                self.cancel_unfinished(&mut wf);
                let mode = if e.kind == ErrorKind::Cancelled {
                    WorkflowMode::Aborted
                } else {
                    WorkflowMode::Failed
                };
                return Ok(self.finish(wf, mode));
            }

            let layer_ids = wf.plan.layers[wf.layer_index].clone();

            // Checkpoints gate the layer before anything runs.
            let checkpoints: Vec<(String, String)> = layer_ids
                .iter()
                .filter_map(|id| match &wf.plan.tasks[id].kind {
                    TaskKind::Checkpoint { message } => Some((id.clone(), message.clone())),
                    _ => None,
                })
                .collect();
            for (task_id, message) in checkpoints {
                if wf.status(&task_id).is_terminal() {
                    continue;
                }
                match wf.checkpoint_decisions.get(&task_id).cloned() {
                    Some(decision) if decision.approved => {
                        wf.record(
                            &task_id,
                            TaskRecord {
                                status: TaskStatus::Succeeded,
                                output: Some(json!({
                                    "approved": true,
                                    "feedback": decision.feedback,
                                })),
                                error: None,
                                duration_ms: 0,
                                attempts: 0,
                            },
                        );
                    }
                    Some(_) => {
                        // Rejections abort at resume time; a rejected
                        // decision can not reach the scheduler again.
                        self.set_status_if_open(&mut wf, &task_id, TaskStatus::Cancelled);
                    }
                    None => {
                        return Ok(self.pause(
                            wf,
                            PauseKind::Checkpoint { task_id, message },
                        ));
                    }
                }
            }

            // Dependency approvals.
            let mut pre_failed = false;
            let gated: Vec<(String, String)> = layer_ids
                .iter()
                .filter(|id| !wf.status(id).is_terminal())
                .filter_map(|id| {
                    wf.plan.tasks[id]
                        .kind
                        .approval_subject()
                        .map(|subject| (id.clone(), subject.to_string()))
                })
                .collect();
            for (task_id, subject) in gated {
                if wf.approved_dependencies.contains(&subject) {
                    continue;
                }
                let Some(reason) = self.dispatcher.needs_approval(&subject) else {
                    continue;
                };
                if depth == 0 {
                    return Ok(self.pause(
                        wf,
                        PauseKind::Dependency {
                            task_id,
                            subject,
                            reason,
                        },
                    ));
                }
                // Nested plans cannot pause; the dependency failure is
                // terminal for the task.
                pre_failed = true;
                wf.record(
                    &task_id,
                    TaskRecord {
                        status: TaskStatus::Failed,
                        output: None,
                        error: Some(GatewayError::dependency(reason)),
                        duration_ms: 0,
                        attempts: 0,
                    },
                );
            }

            if self.config.speculation.enabled {
                self.maybe_speculate(&wf, &pool, ctx, depth);
            }

            let layer_failed = self.run_layer(&mut wf, ctx, depth, &pool).await | pre_failed;
            self.send_event(EngineEvent::LayerCompleted {
                workflow_id: wf.id.clone(),
                layer: wf.layer_index,
            });

            if layer_failed && !wf.continue_on_error {
                return Ok(self.finish(wf, WorkflowMode::Failed));
            }
            wf.layer_index += 1;

            // The validation gate fires after retries exhaust, so it sees
            // final task outcomes.
            if wf.per_layer_validation && depth == 0 && wf.layer_index < wf.plan.layers.len() {
                let layer = wf.layer_index - 1;
                return Ok(self.pause(wf, PauseKind::PerLayerValidation { layer }));
            }
        }
    }

    async fn run_layer(
        self: &Arc<Self>,
        wf: &mut WorkflowState,
        ctx: &CallContext,
        depth: usize,
        pool: &Arc<SpeculationPool>,
    ) -> bool {
        let layer_ids = wf.plan.layers[wf.layer_index].clone();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join: JoinSet<(String, Value, GatewayResult<Value>, u64, u32)> = JoinSet::new();
        let mut any_failed = false;

        for task_id in &layer_ids {
            if wf.status(task_id).is_terminal() {
                continue;
            }
            let task = wf.plan.tasks[task_id].clone();

            let deps_ok = task
                .depends_on
                .iter()
                .all(|dep| wf.status(dep) == TaskStatus::Succeeded || wf.outputs.contains_key(dep));
            if !deps_ok {
                self.skip_task(wf, task_id);
                continue;
            }

            if let Some(guard) = &task.guard {
                match evaluate_guard(guard, &wf.outputs) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.skip_task(wf, task_id);
                        continue;
                    }
                    Err(e) => {
                        any_failed = true;
                        self.fail_task(wf, task_id, &task, e);
                        continue;
                    }
                }
            }

            let resolved = match resolve_arguments(&task.arguments, &wf.outputs) {
                Ok(value) => value,
                Err(e) => {
                    any_failed = true;
                    self.fail_task(wf, task_id, &task, e);
                    continue;
                }
            };

            let spec_hit = pool.take_if_match(task_id, &tmg_wire::fingerprint(&resolved));

            let engine = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let task_ctx = ctx.child();
            let workflow_id = wf.id.clone();
            let id = task_id.clone();
            join.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("layer semaphore closed");
                engine.send_event(EngineEvent::TaskStarted {
                    workflow_id,
                    task_id: id.clone(),
                    target: task.kind.trace_target(),
                });
                let started = Instant::now();
                let (result, attempts) = match spec_hit {
                    Some(value) => {
                        debug!(task = %id, "committing speculative result");
                        (Ok(value), 0)
                    }
                    None => {
                        engine
                            .execute_with_retries(&task, &resolved, &task_ctx, depth)
                            .await
                    }
                };
                (id, resolved, result, started.elapsed().as_millis() as u64, attempts)
            });
        }

        while let Some(joined) = join.join_next().await {
            let (task_id, resolved, result, duration_ms, attempts) = match joined {
                Ok(output) => output,
                Err(e) => {
                    error!(error = %e, "task join failure");
                    any_failed = true;
                    continue;
                }
            };
            let task = wf.plan.tasks[&task_id].clone();
            match result {
                Ok(output) => {
                    let kind = match task.kind {
                        TaskKind::CapabilityInvoke { .. } => TraceKind::CapabilityInvoke,
                        _ => TraceKind::ToolCall,
                    };
                    let event = TraceEvent::new(&wf.id, kind, &task.kind.trace_target())
                        .with_io(&resolved, &output)
                        .with_duration(duration_ms);
                    self.push_trace(wf, event);
                    wf.record(
                        &task_id,
                        TaskRecord {
                            status: TaskStatus::Succeeded,
                            output: Some(output),
                            error: None,
                            duration_ms,
                            attempts,
                        },
                    );
                    self.send_event(EngineEvent::TaskFinished {
                        workflow_id: wf.id.clone(),
                        task_id,
                        status: TaskStatus::Succeeded,
                        duration_ms,
                    });
                }
                Err(e) => {
                    any_failed = true;
                    let event = TraceEvent::new(&wf.id, TraceKind::Error, &task.kind.trace_target())
                        .with_duration(duration_ms)
                        .with_status(e.kind.as_str());
                    self.push_trace(wf, event);
                    wf.record(
                        &task_id,
                        TaskRecord {
                            status: TaskStatus::Failed,
                            output: None,
                            error: Some(e),
                            duration_ms,
                            attempts,
                        },
                    );
                    self.send_event(EngineEvent::TaskFinished {
                        workflow_id: wf.id.clone(),
                        task_id: task_id.clone(),
                        status: TaskStatus::Failed,
                        duration_ms,
                    });
                    if wf.continue_on_error {
                        for dependent in wf.plan.dependents_closure(&task_id) {
                            self.set_status_if_open(wf, &dependent, TaskStatus::Skipped);
                        }
                    }
                }
            }
        }
        any_failed
    }

    async fn execute_with_retries(
        self: &Arc<Self>,
        task: &TaskSpec,
        resolved: &Value,
        ctx: &CallContext,
        depth: usize,
    ) -> (GatewayResult<Value>, u32) {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.dispatch_once(task, resolved, ctx, depth).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) => {
                    let retry = e.retryable
                        && attempt < self.config.retry.max_attempts
                        && ctx.check().is_ok();
                    if !retry {
                        return (Err(e), attempt);
                    }
                    let delay = self.config.retry.delay(attempt);
                    debug!(
                        task = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying task"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn dispatch_once(
        self: &Arc<Self>,
        task: &TaskSpec,
        resolved: &Value,
        ctx: &CallContext,
        depth: usize,
    ) -> GatewayResult<Value> {
        match &task.kind {
            TaskKind::ToolCall { target } => {
                self.dispatcher.call_tool(target, resolved.clone(), ctx).await
            }
            TaskKind::CodeExecution { code, intent } => {
                let request = CodeRequest {
                    code: code.clone(),
                    intent: intent.clone().or_else(|| task.metadata.intent.clone()),
                    context: resolved.clone(),
                    sandbox: task.metadata.sandbox.clone(),
                    speculative: false,
                };
                self.dispatcher.execute_code(request, ctx).await
            }
            TaskKind::CapabilityInvoke { capability } => {
                let blob = self.dispatcher.expand_capability(capability).await?;
                let specs = parse_task_specs(&blob)?;
                let result = Arc::clone(self)
                    .run_nested(specs, ctx.child(), depth + 1)
                    .await;
                self.dispatcher
                    .record_capability_outcome(capability, result.is_ok());
                result
            }
            TaskKind::SubDag { tasks } => {
                Arc::clone(self)
                    .run_nested(tasks.clone(), ctx.child(), depth + 1)
                    .await
            }
            TaskKind::Checkpoint { .. } => Err(GatewayError::internal(
                "checkpoint tasks are resolved before dispatch",
            )),
        }
    }

    /// Nested run for capability expansions and sub-DAGs. Boxed to break
    /// the recursive future type.
    fn run_nested(
        self: Arc<Self>,
        specs: Vec<TaskSpec>,
        ctx: CallContext,
        depth: usize,
    ) -> BoxFuture<'static, GatewayResult<Value>> {
        Box::pin(async move {
            if depth > self.config.max_dag_depth {
                return Err(GatewayError::validation(format!(
                    "nested DAG depth exceeds {}",
                    self.config.max_dag_depth
                )));
            }
            let plan = CompiledPlan::compile_nested(specs)?;
            let wf = WorkflowState::new(Uuid::new_v4().to_string(), plan);
            match self.run_inner(wf, &ctx, depth).await? {
                ExecutionOutcome::Completed(result) => {
                    if result.mode == WorkflowMode::Completed {
                        Ok(result.output)
                    } else {
                        Err(result.first_error().cloned().unwrap_or_else(|| {
                            GatewayError::internal("nested workflow failed without an error")
                        }))
                    }
                }
                ExecutionOutcome::Paused(_) => {
                    Err(GatewayError::internal("nested workflow cannot pause"))
                }
            }
        })
    }

    fn maybe_speculate(
        self: &Arc<Self>,
        wf: &WorkflowState,
        pool: &Arc<SpeculationPool>,
        ctx: &CallContext,
        _depth: usize,
    ) {
        let cfg = &self.config.speculation;
        for layer in wf.plan.layers.iter().skip(wf.layer_index + 1) {
            for task_id in layer {
                if pool.in_flight_count() >= cfg.max_concurrent {
                    return;
                }
                let task = &wf.plan.tasks[task_id];
                let TaskKind::CodeExecution { code, intent } = &task.kind else {
                    continue;
                };
                if wf.status(task_id) != TaskStatus::Pending || pool.contains(task_id) {
                    continue;
                }
                // Inputs must already be resolvable; control-dependencies
                // may still be running.
                let Ok(resolved) = resolve_arguments(&task.arguments, &wf.outputs) else {
                    continue;
                };
                let unfinished = task
                    .depends_on
                    .iter()
                    .filter(|dep| wf.status(dep) != TaskStatus::Succeeded)
                    .count();
                if unfinished == 0 {
                    continue;
                }
                let confidence = cfg.ancestor_confidence.powi(unfinished as i32);
                if confidence < cfg.threshold {
                    continue;
                }

                pool.mark_in_flight(task_id);
                let request = CodeRequest {
                    code: code.clone(),
                    intent: intent.clone().or_else(|| task.metadata.intent.clone()),
                    context: resolved.clone(),
                    sandbox: task.metadata.sandbox.clone(),
                    speculative: true,
                };
                let dispatcher = Arc::clone(&self.dispatcher);
                let pool = Arc::clone(pool);
                let spec_ctx = ctx.child();
                let id = task_id.clone();
                let inputs_fp = tmg_wire::fingerprint(&resolved);
                tokio::spawn(async move {
                    let value = dispatcher.execute_code(request, &spec_ctx).await.ok();
                    pool.complete(&id, inputs_fp, value);
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Bookkeeping
    // ------------------------------------------------------------------

    fn pause(&self, mut wf: WorkflowState, pause: PauseKind) -> ExecutionOutcome {
        wf.mode = match pause {
            PauseKind::PerLayerValidation { .. } => WorkflowMode::PausedForValidation,
            _ => WorkflowMode::PausedForApproval,
        };
        wf.touch();

        let (context, options, checkpoint_id) = match &pause {
            PauseKind::PerLayerValidation { layer } => (
                json!({
                    "completed_layer": layer,
                    "next_layer": wf.plan.layers.get(wf.layer_index).cloned().unwrap_or_default(),
                    "outputs": wf.outputs,
                }),
                vec!["continue".to_string(), "abort".to_string()],
                None,
            ),
            PauseKind::Dependency {
                task_id,
                subject,
                reason,
            } => (
                json!({"task_id": task_id, "subject": subject, "reason": reason}),
                vec![
                    "approve_once".to_string(),
                    "approve_always".to_string(),
                    "reject".to_string(),
                ],
                None,
            ),
            PauseKind::Checkpoint { task_id, message } => (
                json!({"checkpoint_id": task_id, "message": message}),
                vec!["approve".to_string(), "reject".to_string()],
                Some(task_id.clone()),
            ),
        };

        let ticket = PauseTicket {
            workflow_id: wf.id.clone(),
            approval_type: pause.approval_type().to_string(),
            context,
            options,
        };
        self.send_event(EngineEvent::WorkflowPaused {
            workflow_id: wf.id.clone(),
            approval_type: ticket.approval_type.clone(),
        });

        let ttl = match &pause {
            PauseKind::Dependency { .. } => self.config.dependency_ttl,
            _ => self.config.approval_ttl,
        };
        let record = PendingRecord {
            parent_request_id: wf.parent_request_id.clone(),
            checkpoint_id,
            expires_at: Instant::now() + ttl,
            created_at: chrono::Utc::now(),
            state: wf,
            pause,
        };
        let workflow_id = ticket.workflow_id.clone();
        self.pending.insert(workflow_id, record);
        ExecutionOutcome::Paused(ticket)
    }

    fn finish(&self, mut wf: WorkflowState, mode: WorkflowMode) -> ExecutionOutcome {
        let settle = match mode {
            WorkflowMode::Aborted => TaskStatus::Cancelled,
            _ => TaskStatus::Skipped,
        };
        let unfinished: Vec<String> = wf
            .records
            .iter()
            .filter(|(_, record)| !record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in unfinished {
            self.set_status_if_open(&mut wf, &task_id, settle);
        }

        wf.mode = mode;
        wf.touch();
        let status = match mode {
            WorkflowMode::Completed => "ok",
            WorkflowMode::Aborted => "aborted",
            _ => "failed",
        };
        let end = TraceEvent::new(&wf.id, TraceKind::ExecEnd, "workflow").with_status(status);
        self.push_trace(&mut wf, end);
        self.send_event(EngineEvent::WorkflowFinished {
            workflow_id: wf.id.clone(),
            mode,
        });
        debug_assert!(wf.succeeded_set_is_dependency_closed());

        let fold = (mode == WorkflowMode::Completed).then(|| wf.trace_fold());
        let output = wf.terminal_output();
        ExecutionOutcome::Completed(Box::new(WorkflowResult {
            workflow_id: wf.id,
            mode,
            output,
            records: wf.records,
            executed_path: wf.executed_path,
            messages: wf.messages,
            trace: wf.trace,
            fold,
        }))
    }

    fn cancel_unfinished(&self, wf: &mut WorkflowState) {
        let open: Vec<String> = wf
            .records
            .iter()
            .filter(|(_, record)| !record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for task_id in open {
            self.set_status_if_open(wf, &task_id, TaskStatus::Cancelled);
        }
    }

    fn skip_task(&self, wf: &mut WorkflowState, task_id: &str) {
        self.set_status_if_open(wf, task_id, TaskStatus::Skipped);
        self.send_event(EngineEvent::TaskFinished {
            workflow_id: wf.id.clone(),
            task_id: task_id.to_string(),
            status: TaskStatus::Skipped,
            duration_ms: 0,
        });
    }

    fn fail_task(&self, wf: &mut WorkflowState, task_id: &str, task: &TaskSpec, error: GatewayError) {
        let event = TraceEvent::new(&wf.id, TraceKind::Error, &task.kind.trace_target())
            .with_status(error.kind.as_str());
        self.push_trace(wf, event);
        wf.record(
            task_id,
            TaskRecord {
                status: TaskStatus::Failed,
                output: None,
                error: Some(error),
                duration_ms: 0,
                attempts: 0,
            },
        );
        self.send_event(EngineEvent::TaskFinished {
            workflow_id: wf.id.clone(),
            task_id: task_id.to_string(),
            status: TaskStatus::Failed,
            duration_ms: 0,
        });
    }

    fn set_status_if_open(&self, wf: &mut WorkflowState, task_id: &str, status: TaskStatus) {
        let record = wf
            .records
            .entry(task_id.to_string())
            .or_insert_with(TaskRecord::pending);
        if !record.status.is_terminal() {
            record.status = status;
        }
    }

    fn push_trace(&self, wf: &mut WorkflowState, event: TraceEvent) {
        wf.trace.push(event.clone());
        self.send_event(EngineEvent::Trace(event));
    }

    fn send_event(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return,
                    _ = interval.tick() => {}
                }
                for (workflow_id, _record) in self.pending.sweep() {
                    warn!(workflow_id = %workflow_id, "pending workflow expired");
                    self.send_event(EngineEvent::WorkflowExpired { workflow_id });
                }
            }
        });
    }
}
