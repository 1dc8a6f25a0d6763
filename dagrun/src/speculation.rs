//! Speculative execution of future code tasks.
//!
//! A task whose inputs are already fully resolvable may run in a shadow
//! sandbox while its control-dependencies are still in flight. The result
//! commits only when the real predecessors succeed and the resolved inputs
//! at commit time are identical to the speculated ones; otherwise it is
//! discarded. Off by default.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct SpeculationConfig {
    pub enabled: bool,
    /// Minimum aggregated ancestor confidence to speculate.
    pub threshold: f64,
    /// Per-ancestor prior used to aggregate confidence.
    pub ancestor_confidence: f64,
    pub max_concurrent: usize,
}

impl Default for SpeculationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 0.8,
            ancestor_confidence: 0.9,
            max_concurrent: 2,
        }
    }
}

enum SpecEntry {
    InFlight,
    Done { inputs_fp: String, value: Value },
}

/// Shadow results keyed by task id, shared between the scheduler and the
/// detached speculation tasks.
#[derive(Default)]
pub struct SpeculationPool {
    entries: Mutex<HashMap<String, SpecEntry>>,
}

impl SpeculationPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, task_id: &str) -> bool {
        self.entries.lock().contains_key(task_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| matches!(entry, SpecEntry::InFlight))
            .count()
    }

    pub fn mark_in_flight(&self, task_id: &str) {
        self.entries
            .lock()
            .insert(task_id.to_string(), SpecEntry::InFlight);
    }

    /// Record a finished speculation; `None` (execution failed) clears the
    /// slot so the real run proceeds normally.
    pub fn complete(&self, task_id: &str, inputs_fp: String, value: Option<Value>) {
        let mut entries = self.entries.lock();
        match value {
            Some(value) => {
                entries.insert(task_id.to_string(), SpecEntry::Done { inputs_fp, value });
            }
            None => {
                entries.remove(task_id);
            }
        }
    }

    /// Commit rule: same resolved inputs. Removes the entry either way so a
    /// stale speculation is never consulted twice.
    pub fn take_if_match(&self, task_id: &str, inputs_fp: &str) -> Option<Value> {
        let mut entries = self.entries.lock();
        match entries.remove(task_id) {
            Some(SpecEntry::Done {
                inputs_fp: speculated,
                value,
            }) if speculated == inputs_fp => Some(value),
            _ => None,
        }
    }
}
