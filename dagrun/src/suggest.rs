//! DAG suggestion: turn an intent string into an executable plan.
//!
//! Capability-first: when a learned capability matches the intent above
//! the threshold, its plan is the suggestion. Otherwise a plan is
//! synthesized by chaining the top-ranked tools, linking consecutive
//! tools when the graph has a dependency edge between them or their
//! schemas look compatible.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use tmg_discovery::descriptor::{schema_keywords, ToolDescriptor};
use tmg_discovery::graph::EdgeKind;
use tmg_discovery::{EntityKind, Registry, SearchOptions};
use tmg_wire::{GatewayError, GatewayResult};

use crate::task::{parse_task_specs, TaskKind, TaskMetadata, TaskSpec};

#[derive(Debug, Clone)]
pub struct SuggestConfig {
    /// Minimum capability score to reuse a learned plan outright.
    pub capability_threshold: f64,
    /// Tool count cap for synthesized plans.
    pub max_tools: usize,
}

impl Default for SuggestConfig {
    fn default() -> Self {
        Self {
            capability_threshold: 0.7,
            max_tools: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SuggestionSource {
    Capability { id: String },
    Synthesized,
}

#[derive(Debug, Clone)]
pub struct SuggestedPlan {
    pub tasks: Vec<TaskSpec>,
    pub confidence: f64,
    pub source: SuggestionSource,
}

pub struct Suggester {
    registry: Arc<Registry>,
    config: SuggestConfig,
}

impl Suggester {
    pub fn new(registry: Arc<Registry>, config: SuggestConfig) -> Self {
        Self { registry, config }
    }

    pub async fn suggest(&self, intent: &str) -> GatewayResult<SuggestedPlan> {
        let capabilities = self.registry.search_capabilities(intent, 3).await?;
        if let Some(best) = capabilities.first() {
            if best.score >= self.config.capability_threshold {
                if let Some(plan) = self.registry.expand_capability(&best.id) {
                    let tasks = parse_task_specs(&plan)?;
                    return Ok(SuggestedPlan {
                        tasks,
                        confidence: best.score,
                        source: SuggestionSource::Capability {
                            id: best.id.clone(),
                        },
                    });
                }
            }
        }

        let opts = SearchOptions {
            limit: self.config.max_tools,
            kind: Some(EntityKind::Tool),
            ..SearchOptions::default()
        };
        let hits = self.registry.search(intent, &opts).await?;
        if hits.is_empty() {
            return Err(GatewayError::validation(format!(
                "no tools match intent '{}'",
                intent
            )));
        }

        let graph = self.registry.graph();
        let snapshot = self.registry.snapshot();
        let mut tasks: Vec<TaskSpec> = Vec::with_capacity(hits.len());
        let mut previous: Option<(String, String)> = None;
        for (index, hit) in hits.iter().enumerate() {
            let task_id = format!("t{}", index + 1);
            let mut depends_on = Vec::new();
            if let Some((prev_task, prev_tool)) = &previous {
                let linked = graph.edge_weight(prev_tool, &hit.id, EdgeKind::Dependency) > 0.0
                    || schema_compatible(
                        snapshot.tools.get(prev_tool.as_str()),
                        snapshot.tools.get(hit.id.as_str()),
                    );
                if linked {
                    depends_on.push(prev_task.clone());
                }
            }
            tasks.push(TaskSpec {
                id: task_id.clone(),
                kind: TaskKind::ToolCall {
                    target: hit.id.clone(),
                },
                arguments: json!({}),
                depends_on,
                guard: None,
                metadata: TaskMetadata {
                    intent: Some(intent.to_string()),
                    sandbox: None,
                },
            });
            previous = Some((task_id, hit.id.clone()));
        }

        let mean_score = hits.iter().map(|hit| hit.score).sum::<f64>() / hits.len() as f64;
        Ok(SuggestedPlan {
            tasks,
            // Synthesized plans are discounted against learned ones.
            confidence: (mean_score * 0.75).min(1.0),
            source: SuggestionSource::Synthesized,
        })
    }
}

/// Heuristic schema compatibility: the producer and consumer declare at
/// least one property name in common.
fn schema_compatible(producer: Option<&ToolDescriptor>, consumer: Option<&ToolDescriptor>) -> bool {
    let (Some(producer), Some(consumer)) = (producer, consumer) else {
        return false;
    };
    let producer_keys: HashSet<String> =
        schema_keywords(&producer.input_schema).into_iter().collect();
    schema_keywords(&consumer.input_schema)
        .into_iter()
        .any(|key| key != "string" && key != "object" && producer_keys.contains(&key))
}
