//! Workflow instance state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tmg_discovery::graph::TraceFold;

use crate::plan::CompiledPlan;
use crate::reference::collect_refs;
use crate::task::{TaskRecord, TaskStatus};
use crate::trace::TraceEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowMode {
    Running,
    PausedForValidation,
    PausedForApproval,
    Completed,
    Aborted,
    Failed,
}

impl WorkflowMode {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowMode::Completed | WorkflowMode::Aborted | WorkflowMode::Failed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointDecision {
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

/// Mutable state of one workflow. The plan is immutable (replan swaps it
/// wholesale); everything else transitions monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub id: String,
    pub plan: CompiledPlan,
    pub records: HashMap<String, TaskRecord>,
    pub outputs: HashMap<String, Value>,
    pub layer_index: usize,
    pub mode: WorkflowMode,
    pub messages: Vec<String>,
    /// Targets of succeeded tasks in completion order.
    pub executed_path: Vec<String>,
    pub continue_on_error: bool,
    pub per_layer_validation: bool,
    /// Dependency subjects approved for this workflow.
    pub approved_dependencies: HashSet<String>,
    pub checkpoint_decisions: HashMap<String, CheckpointDecision>,
    pub trace: Vec<TraceEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowState {
    pub fn new(id: String, plan: CompiledPlan) -> Self {
        let records = plan
            .tasks
            .keys()
            .map(|task_id| (task_id.clone(), TaskRecord::pending()))
            .collect();
        let now = Utc::now();
        Self {
            id,
            plan,
            records,
            outputs: HashMap::new(),
            layer_index: 0,
            mode: WorkflowMode::Running,
            messages: Vec::new(),
            executed_path: Vec::new(),
            continue_on_error: false,
            per_layer_validation: false,
            approved_dependencies: HashSet::new(),
            checkpoint_decisions: HashMap::new(),
            trace: Vec::new(),
            parent_request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self, task_id: &str) -> TaskStatus {
        self.records
            .get(task_id)
            .map_or(TaskStatus::Pending, |r| r.status)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn log(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
        self.touch();
    }

    /// Record a task outcome. Successful outputs become addressable by
    /// later references; successful targets extend the executed path.
    pub fn record(&mut self, task_id: &str, record: TaskRecord) {
        if record.status == TaskStatus::Succeeded {
            if let Some(output) = &record.output {
                self.outputs.insert(task_id.to_string(), output.clone());
            } else {
                self.outputs.insert(task_id.to_string(), Value::Null);
            }
            if let Some(task) = self.plan.tasks.get(task_id) {
                self.executed_path.push(task.kind.trace_target());
            }
        }
        self.records.insert(task_id.to_string(), record);
        self.touch();
    }

    /// True when every declared dependency of the task succeeded.
    pub fn deps_succeeded(&self, task_id: &str) -> bool {
        let Some(task) = self.plan.tasks.get(task_id) else {
            return false;
        };
        task.depends_on
            .iter()
            .all(|dep| self.status(dep) == TaskStatus::Succeeded || self.outputs.contains_key(dep))
    }

    /// Invariant check: succeeded task ids form a dependency-closed set.
    pub fn succeeded_set_is_dependency_closed(&self) -> bool {
        self.records
            .iter()
            .filter(|(_, record)| record.status == TaskStatus::Succeeded)
            .all(|(task_id, _)| {
                self.plan
                    .tasks
                    .get(task_id)
                    .map(|task| {
                        task.depends_on.iter().all(|dep| {
                            self.status(dep) == TaskStatus::Succeeded
                                || self.outputs.contains_key(dep)
                        })
                    })
                    // Tasks carried over from before a replan may no longer
                    // be in the plan; their deps were checked when they ran.
                    .unwrap_or(true)
            })
    }

    /// Terminal output of the workflow: the single sink task's output, or a
    /// map of sink outputs when there are several.
    pub fn terminal_output(&self) -> Value {
        let sinks = self.plan.sink_tasks();
        match sinks.as_slice() {
            [] => Value::Null,
            [only] => self.outputs.get(only).cloned().unwrap_or(Value::Null),
            many => {
                let mut map = serde_json::Map::new();
                for sink in many {
                    map.insert(
                        sink.clone(),
                        self.outputs.get(sink).cloned().unwrap_or(Value::Null),
                    );
                }
                Value::Object(map)
            }
        }
    }

    /// Distill the run into graph edge deltas: the executed path plus
    /// `(producer, consumer)` pairs for every resolved output reference.
    pub fn trace_fold(&self) -> TraceFold {
        let mut dependency_pairs = Vec::new();
        for (task_id, record) in &self.records {
            if record.status != TaskStatus::Succeeded {
                continue;
            }
            let Some(task) = self.plan.tasks.get(task_id) else {
                continue;
            };
            let mut refs = Vec::new();
            collect_refs(&task.arguments, &mut refs);
            let consumer = task.kind.trace_target();
            let mut seen: HashSet<String> = HashSet::new();
            for reference in refs {
                let Some(producer_task) = self.plan.tasks.get(&reference.task_id) else {
                    continue;
                };
                let producer = producer_task.kind.trace_target();
                if producer != consumer && seen.insert(producer.clone()) {
                    dependency_pairs.push((producer, consumer.clone()));
                }
            }
        }
        TraceFold {
            trace_id: self.id.clone(),
            executed_path: self.executed_path.clone(),
            dependency_pairs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskSpec;
    use serde_json::json;

    fn two_layer_state() -> WorkflowState {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("t1", "fs:read", json!({}), &[]),
            TaskSpec::tool("t2", "fs:write", json!({"v": "$t1"}), &["t1"]),
        ])
        .unwrap();
        WorkflowState::new("wf-1".to_string(), plan)
    }

    fn succeeded(output: Value) -> TaskRecord {
        TaskRecord {
            status: TaskStatus::Succeeded,
            output: Some(output),
            error: None,
            duration_ms: 1,
            attempts: 1,
        }
    }

    #[test]
    fn recording_success_exposes_outputs() {
        let mut state = two_layer_state();
        state.record("t1", succeeded(json!("A")));
        assert_eq!(state.outputs["t1"], json!("A"));
        assert_eq!(state.executed_path, vec!["fs:read"]);
        assert!(state.deps_succeeded("t2"));
    }

    #[test]
    fn succeeded_set_stays_dependency_closed() {
        let mut state = two_layer_state();
        assert!(state.succeeded_set_is_dependency_closed());
        state.record("t1", succeeded(json!("A")));
        state.record("t2", succeeded(json!("B")));
        assert!(state.succeeded_set_is_dependency_closed());
    }

    #[test]
    fn terminal_output_uses_single_sink() {
        let mut state = two_layer_state();
        state.record("t1", succeeded(json!("A")));
        state.record("t2", succeeded(json!("written")));
        assert_eq!(state.terminal_output(), json!("written"));
    }

    #[test]
    fn terminal_output_maps_multiple_sinks() {
        let plan = CompiledPlan::compile(vec![
            TaskSpec::tool("a", "x:a", json!({}), &[]),
            TaskSpec::tool("b", "x:b", json!({}), &[]),
        ])
        .unwrap();
        let mut state = WorkflowState::new("wf".to_string(), plan);
        state.record("a", succeeded(json!(1)));
        state.record("b", succeeded(json!(2)));
        assert_eq!(state.terminal_output(), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn trace_fold_includes_dependency_pairs() {
        let mut state = two_layer_state();
        state.record("t1", succeeded(json!("A")));
        state.record("t2", succeeded(json!("ok")));
        let fold = state.trace_fold();
        assert_eq!(fold.trace_id, "wf-1");
        assert_eq!(fold.executed_path, vec!["fs:read", "fs:write"]);
        assert!(fold
            .dependency_pairs
            .contains(&("fs:read".to_string(), "fs:write".to_string())));
    }

    #[test]
    fn mode_terminality() {
        assert!(WorkflowMode::Completed.is_terminal());
        assert!(WorkflowMode::Failed.is_terminal());
        assert!(!WorkflowMode::PausedForApproval.is_terminal());
    }
}
