//! Capabilities: learned, reusable plans expressed as DAG fragments.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A learned pattern: intent text plus a plan blob (task declarations in
/// the engine's submission format), with bookkeeping for ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capability {
    pub id: String,
    pub intent: String,
    /// DAG fragment in the engine's task-declaration JSON.
    pub plan: Value,
    pub success_rate: f64,
    pub reuse_count: u64,
    pub content_hash: String,
}

impl Capability {
    pub fn new(id: impl Into<String>, intent: impl Into<String>, plan: Value) -> Self {
        let id = id.into();
        let intent = intent.into();
        let content_hash = tmg_wire::content_hash(&[&id, &intent, &plan.to_string()]);
        Self {
            id,
            intent,
            plan,
            success_rate: 0.0,
            reuse_count: 0,
            content_hash,
        }
    }

    /// Text indexed for semantic search.
    pub fn document(&self) -> String {
        let mut doc = self.intent.clone();
        for tool in self.tool_targets() {
            doc.push(' ');
            doc.push_str(&tool);
        }
        doc
    }

    /// Qualified tool names referenced by the plan's tool-call tasks. Used
    /// to materialize `contains` edges.
    pub fn tool_targets(&self) -> Vec<String> {
        let mut targets = Vec::new();
        let Some(tasks) = self.plan.get("tasks").and_then(Value::as_array) else {
            return targets;
        };
        for task in tasks {
            let kind = task.get("kind").and_then(Value::as_str).unwrap_or("tool_call");
            if kind != "tool_call" {
                continue;
            }
            if let Some(target) = task.get("target").and_then(Value::as_str) {
                if !targets.iter().any(|t| t == target) {
                    targets.push(target.to_string());
                }
            }
        }
        targets
    }

    /// Exponentially weighted success estimate; newer observations count
    /// for 20%.
    pub fn record_use(&mut self, success: bool) {
        let observation = if success { 1.0 } else { 0.0 };
        self.success_rate = if self.reuse_count == 0 {
            observation
        } else {
            self.success_rate * 0.8 + observation * 0.2
        };
        self.reuse_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan() -> Value {
        json!({
            "tasks": [
                {"id": "t1", "kind": "tool_call", "target": "fs:read_file", "arguments": {}},
                {"id": "t2", "kind": "tool_call", "target": "fs:write_file", "dependsOn": ["t1"]},
                {"id": "t3", "kind": "code_execution", "target": "", "dependsOn": ["t2"]}
            ]
        })
    }

    #[test]
    fn tool_targets_skips_non_tool_tasks() {
        let cap = Capability::new("cap1", "copy a file", plan());
        assert_eq!(cap.tool_targets(), vec!["fs:read_file", "fs:write_file"]);
    }

    #[test]
    fn record_use_tracks_success_rate() {
        let mut cap = Capability::new("cap1", "copy a file", plan());
        cap.record_use(true);
        assert_eq!(cap.success_rate, 1.0);
        cap.record_use(false);
        assert!(cap.success_rate < 1.0 && cap.success_rate > 0.0);
        assert_eq!(cap.reuse_count, 2);
    }

    #[test]
    fn document_mentions_intent_and_tools() {
        let cap = Capability::new("cap1", "copy a file", plan());
        let doc = cap.document();
        assert!(doc.contains("copy a file"));
        assert!(doc.contains("fs:read_file"));
    }

    #[test]
    fn content_hash_changes_with_plan() {
        let a = Capability::new("cap1", "copy", json!({"tasks": []}));
        let b = Capability::new("cap1", "copy", plan());
        assert_ne!(a.content_hash, b.content_hash);
    }
}
