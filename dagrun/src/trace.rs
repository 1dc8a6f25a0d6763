//! Trace events and the engine's observable event stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TraceKind {
    ExecStart,
    ToolCall,
    CapabilityInvoke,
    Error,
    ExecEnd,
}

/// Append-only record of a single observable action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Workflow id this event belongs to.
    pub root_id: String,
    pub ts: DateTime<Utc>,
    pub duration_ms: u64,
    pub kind: TraceKind,
    pub target: String,
    pub input_fp: String,
    pub output_fp: String,
    pub status: String,
}

impl TraceEvent {
    pub fn new(root_id: &str, kind: TraceKind, target: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            root_id: root_id.to_string(),
            ts: Utc::now(),
            duration_ms: 0,
            kind,
            target: target.to_string(),
            input_fp: String::new(),
            output_fp: String::new(),
            status: "ok".to_string(),
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_io(mut self, input: &Value, output: &Value) -> Self {
        self.input_fp = tmg_wire::fingerprint(input);
        self.output_fp = tmg_wire::fingerprint(output);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = status.to_string();
        self
    }
}

/// Events published on the engine's broadcast channel; consumed by the SSE
/// router and the trace sink.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskStarted {
        workflow_id: String,
        task_id: String,
        target: String,
    },
    TaskFinished {
        workflow_id: String,
        task_id: String,
        status: crate::task::TaskStatus,
        duration_ms: u64,
    },
    LayerCompleted {
        workflow_id: String,
        layer: usize,
    },
    WorkflowPaused {
        workflow_id: String,
        approval_type: String,
    },
    WorkflowFinished {
        workflow_id: String,
        mode: crate::state::WorkflowMode,
    },
    WorkflowExpired {
        workflow_id: String,
    },
    Trace(TraceEvent),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprints_are_deterministic() {
        let a = TraceEvent::new("wf", TraceKind::ToolCall, "fs:read")
            .with_io(&json!({"p": 1}), &json!("out"));
        let b = TraceEvent::new("wf", TraceKind::ToolCall, "fs:read")
            .with_io(&json!({"p": 1}), &json!("out"));
        assert_eq!(a.input_fp, b.input_fp);
        assert_eq!(a.output_fp, b.output_fp);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn kind_serializes_kebab_case() {
        let raw = serde_json::to_string(&TraceKind::ExecStart).unwrap();
        assert_eq!(raw, "\"exec-start\"");
    }

    #[test]
    fn engine_events_are_tagged() {
        let event = EngineEvent::LayerCompleted {
            workflow_id: "w".to_string(),
            layer: 2,
        };
        let raw = serde_json::to_value(&event).unwrap();
        assert_eq!(raw["event"], "layer_completed");
        assert_eq!(raw["layer"], 2);
    }
}
