//! Pending-workflow store: paused workflows addressable by opaque id.
//!
//! Paused state moves here and stays until resumed or expired. Expired
//! entries leave a bounded tombstone behind so late resumes fail with a
//! well-defined error instead of "unknown workflow".

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use tmg_wire::{GatewayError, GatewayResult};

use crate::state::WorkflowState;

/// Default expiry for human approval checkpoints.
pub const DEFAULT_APPROVAL_TTL: Duration = Duration::from_secs(3600);
/// Default expiry for dependency/auth approvals.
pub const DEFAULT_DEPENDENCY_TTL: Duration = Duration::from_secs(300);

const TOMBSTONE_CAP: usize = 1024;

/// Why a workflow paused.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PauseKind {
    PerLayerValidation {
        layer: usize,
    },
    Dependency {
        task_id: String,
        subject: String,
        reason: String,
    },
    Checkpoint {
        task_id: String,
        message: String,
    },
}

impl PauseKind {
    pub fn approval_type(&self) -> &'static str {
        match self {
            PauseKind::PerLayerValidation { .. } => "per_layer",
            PauseKind::Dependency { .. } => "dependency",
            PauseKind::Checkpoint { .. } => "checkpoint",
        }
    }

    pub fn default_ttl(&self) -> Duration {
        match self {
            PauseKind::Checkpoint { .. } | PauseKind::PerLayerValidation { .. } => {
                DEFAULT_APPROVAL_TTL
            }
            PauseKind::Dependency { .. } => DEFAULT_DEPENDENCY_TTL,
        }
    }
}

pub struct PendingRecord {
    pub state: WorkflowState,
    pub pause: PauseKind,
    pub parent_request_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub expires_at: Instant,
    pub created_at: DateTime<Utc>,
}

impl PendingRecord {
    /// Shape handed to the external persistence collaborator.
    pub fn persisted_shape(&self, id: &str) -> Value {
        json!({
            "id": id,
            "state_blob": serde_json::to_value(&self.state).unwrap_or(Value::Null),
            "pause_kind": self.pause.approval_type(),
            "expires_at": self.created_at
                + chrono::Duration::from_std(self.expires_at.saturating_duration_since(Instant::now()))
                    .unwrap_or_default(),
            "parent_request_id": self.parent_request_id,
        })
    }
}

#[derive(Default)]
pub struct PendingStore {
    entries: DashMap<String, PendingRecord>,
    tombstones: Mutex<(VecDeque<String>, HashMap<String, String>)>,
}

impl PendingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: String, record: PendingRecord) {
        self.entries.insert(id, record);
    }

    /// Take exclusive ownership of a paused workflow for resume.
    pub fn take(&self, id: &str) -> GatewayResult<PendingRecord> {
        if let Some((_, record)) = self.entries.remove(id) {
            if record.expires_at <= Instant::now() {
                self.bury(id, "expired");
                return Err(GatewayError::validation(format!(
                    "workflow '{}' has expired",
                    id
                )));
            }
            return Ok(record);
        }
        let tombstones = self.tombstones.lock();
        match tombstones.1.get(id) {
            Some(reason) => Err(GatewayError::validation(format!(
                "workflow '{}' is no longer resumable: {}",
                id, reason
            ))),
            None => Err(GatewayError::validation(format!(
                "unknown workflow '{}'",
                id
            ))),
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove and return every expired entry.
    pub fn sweep(&self) -> Vec<(String, PendingRecord)> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = Vec::with_capacity(expired.len());
        for id in expired {
            if let Some((id, record)) = self.entries.remove(&id) {
                self.bury(&id, "expired");
                removed.push((id, record));
            }
        }
        removed
    }

    fn bury(&self, id: &str, reason: &str) {
        let mut tombstones = self.tombstones.lock();
        if tombstones.1.insert(id.to_string(), reason.to_string()).is_none() {
            tombstones.0.push_back(id.to_string());
            if tombstones.0.len() > TOMBSTONE_CAP {
                if let Some(evicted) = tombstones.0.pop_front() {
                    tombstones.1.remove(&evicted);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::CompiledPlan;

    fn record(ttl: Duration) -> PendingRecord {
        PendingRecord {
            state: WorkflowState::new("wf".to_string(), CompiledPlan::compile(vec![]).unwrap()),
            pause: PauseKind::PerLayerValidation { layer: 0 },
            parent_request_id: None,
            checkpoint_id: None,
            expires_at: Instant::now() + ttl,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn take_returns_stored_record_once() {
        let store = PendingStore::new();
        store.insert("p1".to_string(), record(Duration::from_secs(60)));
        assert!(store.contains("p1"));
        assert!(store.take("p1").is_ok());
        let err = store.take("p1").unwrap_err();
        assert!(err.message.contains("unknown"));
    }

    #[test]
    fn expired_entries_fail_with_expired_error() {
        let store = PendingStore::new();
        store.insert("p1".to_string(), record(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(5));
        let err = store.take("p1").unwrap_err();
        assert!(err.message.contains("expired"));
        // Resume after expiry keeps failing with the recorded reason.
        let err = store.take("p1").unwrap_err();
        assert!(err.message.contains("expired"));
    }

    #[test]
    fn sweep_removes_only_expired() {
        let store = PendingStore::new();
        store.insert("old".to_string(), record(Duration::ZERO));
        store.insert("new".to_string(), record(Duration::from_secs(60)));
        std::thread::sleep(Duration::from_millis(5));
        let removed = store.sweep();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "old");
        assert!(store.contains("new"));
    }

    #[test]
    fn ttl_defaults_differ_by_kind() {
        assert_eq!(
            PauseKind::Checkpoint {
                task_id: "t".to_string(),
                message: String::new()
            }
            .default_ttl(),
            DEFAULT_APPROVAL_TTL
        );
        assert_eq!(
            PauseKind::Dependency {
                task_id: "t".to_string(),
                subject: "s".to_string(),
                reason: String::new()
            }
            .default_ttl(),
            DEFAULT_DEPENDENCY_TTL
        );
    }
}
