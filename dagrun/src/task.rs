//! Task declarations and per-task execution records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tmg_wire::GatewayError;

/// What a task does. Closed set: the scheduler has an explicit case per
/// variant and new kinds must be added there too.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TaskKind {
    /// Call one upstream tool, addressed as `server:tool`.
    ToolCall { target: String },
    /// Run user code in the sandbox.
    CodeExecution {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        intent: Option<String>,
    },
    /// Expand a learned capability and run it as a nested DAG.
    CapabilityInvoke { capability: String },
    /// Run an inline nested DAG.
    SubDag { tasks: Vec<TaskSpec> },
    /// Human approval gate; the workflow pauses when this task becomes
    /// ready and resumes on `approval_response`.
    Checkpoint {
        #[serde(default)]
        message: String,
    },
}

impl TaskKind {
    /// Target string recorded in traces and folded into the graph.
    pub fn trace_target(&self) -> String {
        match self {
            TaskKind::ToolCall { target } => target.clone(),
            TaskKind::CodeExecution { .. } => "code".to_string(),
            TaskKind::CapabilityInvoke { capability } => capability.clone(),
            TaskKind::SubDag { .. } => "sub-dag".to_string(),
            TaskKind::Checkpoint { .. } => "checkpoint".to_string(),
        }
    }

    /// Approval subject for dependency gating, when the kind has one.
    pub fn approval_subject(&self) -> Option<&str> {
        match self {
            TaskKind::ToolCall { target } => Some(target),
            TaskKind::CapabilityInvoke { capability } => Some(capability),
            _ => None,
        }
    }
}

/// Free-form task metadata: intent for discovery, sandbox overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<Value>,
}

/// One declared task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    #[serde(flatten)]
    pub kind: TaskKind,
    /// Input arguments; may contain `$task.path` references and `${...}`
    /// templates resolved at execution time.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub arguments: Value,
    #[serde(default, rename = "dependsOn", alias = "depends_on")]
    pub depends_on: Vec<String>,
    /// Optional guard: an output-reference expression; a falsy result
    /// skips the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guard: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl TaskSpec {
    pub fn tool(id: &str, target: &str, arguments: Value, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            kind: TaskKind::ToolCall {
                target: target.to_string(),
            },
            arguments,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            guard: None,
            metadata: TaskMetadata::default(),
        }
    }

    pub fn code(id: &str, code: &str, arguments: Value, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            kind: TaskKind::CodeExecution {
                code: code.to_string(),
                intent: None,
            },
            arguments,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            guard: None,
            metadata: TaskMetadata::default(),
        }
    }

    pub fn checkpoint(id: &str, message: &str, depends_on: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            kind: TaskKind::Checkpoint {
                message: message.to_string(),
            },
            arguments: Value::Null,
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            guard: None,
            metadata: TaskMetadata::default(),
        }
    }
}

/// Parse task declarations from a plan blob: either `{"tasks": [...]}` or a
/// bare array.
pub fn parse_task_specs(value: &Value) -> Result<Vec<TaskSpec>, GatewayError> {
    let tasks = match value {
        Value::Object(map) => map
            .get("tasks")
            .ok_or_else(|| GatewayError::validation("plan object is missing 'tasks'"))?,
        Value::Array(_) => value,
        _ => return Err(GatewayError::validation("plan must be an object or an array")),
    };
    serde_json::from_value(tasks.clone())
        .map_err(|e| GatewayError::validation(format!("malformed task declarations: {}", e)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Cancelled
        )
    }
}

/// Execution record for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
    pub duration_ms: u64,
    pub attempts: u32,
}

impl TaskRecord {
    pub fn pending() -> Self {
        Self {
            status: TaskStatus::Pending,
            output: None,
            error: None,
            duration_ms: 0,
            attempts: 0,
        }
    }
}
