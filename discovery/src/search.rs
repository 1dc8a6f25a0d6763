//! Hybrid ranking: cosine similarity + graph relatedness + structural prior.

use serde::{Deserialize, Serialize};

use tmg_wire::GatewayResult;

use crate::registry::Registry;
use crate::vector::EntityKind;

/// Blend weights for the hybrid score. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SearchWeights {
    pub alpha: f64,
    pub beta: f64,
    pub gamma: f64,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            beta: 0.25,
            gamma: 0.15,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub limit: usize,
    /// Inject the highest-relatedness candidates missing from the top list,
    /// up to `limit / 2` extras.
    pub include_related: bool,
    /// Already-used tools; biases ranking toward their graph neighborhood.
    pub context_tools: Vec<String>,
    pub kind: Option<EntityKind>,
    pub weights: SearchWeights,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 8,
            include_related: false,
            context_tools: Vec::new(),
            kind: None,
            weights: SearchWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub kind: EntityKind,
    pub score: f64,
    pub similarity: f64,
    pub relatedness: f64,
    pub prior: f64,
    /// Human-readable summary: tool description or capability intent.
    pub summary: String,
}

impl Registry {
    /// Rank catalog entries against a natural-language query.
    pub async fn search(&self, query: &str, opts: &SearchOptions) -> GatewayResult<Vec<SearchHit>> {
        if opts.limit == 0 {
            return Ok(Vec::new());
        }
        let query_vector = self.embedder().embed(query).await?;
        let window = (opts.limit * 4).max(16);
        let candidates = self
            .vectors()
            .top_k(&query_vector, window, opts.kind)
            .await?;

        let snapshot = self.snapshot();
        let graph = self.graph();

        struct Scored {
            id: String,
            kind: EntityKind,
            sim: f64,
            rel_raw: f64,
            prio_raw: f64,
            summary: String,
        }

        let mut scored: Vec<Scored> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            // Stale vectors may outlive catalog entries briefly; skip them.
            let summary = match candidate.kind {
                EntityKind::Tool => match snapshot.tools.get(&candidate.id) {
                    Some(tool) => tool.description.clone(),
                    None => continue,
                },
                EntityKind::Capability => match snapshot.capabilities.get(&candidate.id) {
                    Some(cap) => cap.intent.clone(),
                    None => continue,
                },
            };
            scored.push(Scored {
                rel_raw: graph.relatedness(&candidate.id, &opts.context_tools),
                prio_raw: graph.pagerank_score(&candidate.id),
                id: candidate.id,
                kind: candidate.kind,
                sim: candidate.score as f64,
                summary,
            });
        }

        // Normalize relatedness and prior to the candidate window so all
        // three terms share a 0..1 scale.
        let rel_max = scored.iter().map(|s| s.rel_raw).fold(0.0, f64::max);
        let prio_max = scored.iter().map(|s| s.prio_raw).fold(0.0, f64::max);

        let mut hits: Vec<SearchHit> = scored
            .into_iter()
            .map(|s| {
                let rel = if rel_max > 0.0 { s.rel_raw / rel_max } else { 0.0 };
                let prio = if prio_max > 0.0 { s.prio_raw / prio_max } else { 0.0 };
                SearchHit {
                    score: opts.weights.alpha * s.sim
                        + opts.weights.beta * rel
                        + opts.weights.gamma * prio,
                    id: s.id,
                    kind: s.kind,
                    similarity: s.sim,
                    relatedness: rel,
                    prior: prio,
                    summary: s.summary,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.similarity
                        .partial_cmp(&a.similarity)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.id.cmp(&b.id))
        });

        let mut top: Vec<SearchHit> = Vec::with_capacity(opts.limit);
        let mut rest: Vec<SearchHit> = Vec::new();
        for hit in hits {
            if top.len() < opts.limit {
                top.push(hit);
            } else {
                rest.push(hit);
            }
        }

        if opts.include_related && !rest.is_empty() {
            let overflow = (opts.limit / 2).max(1);
            rest.sort_by(|a, b| {
                b.relatedness
                    .partial_cmp(&a.relatedness)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
            top.extend(rest.into_iter().take(overflow).filter(|h| h.relatedness > 0.0));
        }

        Ok(top)
    }

    /// Capability-only search used by intent matching and the DAG suggester.
    pub async fn search_capabilities(
        &self,
        intent: &str,
        limit: usize,
    ) -> GatewayResult<Vec<SearchHit>> {
        let opts = SearchOptions {
            limit,
            kind: Some(EntityKind::Capability),
            ..SearchOptions::default()
        };
        self.search(intent, &opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;
    use crate::descriptor::ToolDescriptor;
    use crate::embedding::HashingEmbedder;
    use crate::graph::{EdgeKind, KnowledgeGraph};
    use crate::vector::InMemoryVectorStore;
    use serde_json::json;
    use std::sync::Arc;
    use tmg_wire::mcp::WireTool;

    fn descriptor(server: &str, name: &str, description: &str) -> ToolDescriptor {
        ToolDescriptor::from_wire(
            server,
            WireTool {
                name: name.to_string(),
                title: None,
                description: Some(description.to_string()),
                input_schema: json!({"type": "object"}),
            },
        )
    }

    async fn registry_with_tools() -> Registry {
        let registry = Registry::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(KnowledgeGraph::default()),
        );
        registry
            .apply_server_tools(
                "srv",
                vec![
                    descriptor("srv", "read_json", "read a json configuration document"),
                    descriptor("srv", "list_files", "list files in a directory"),
                    descriptor("srv", "create_memory", "create a memory entity"),
                ],
            )
            .await;
        registry
    }

    #[tokio::test]
    async fn similarity_dominates_without_context() {
        let registry = registry_with_tools().await;
        let hits = registry
            .search("parse json configuration", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hits[0].id, "srv:read_json");
    }

    #[tokio::test]
    async fn context_boost_lifts_related_tools() {
        let registry = registry_with_tools().await;
        // Strong co-occurrence between read_json and create_memory.
        registry
            .graph()
            .set_edge("srv:read_json", "srv:create_memory", EdgeKind::Related, 5.0);

        let opts = SearchOptions {
            limit: 3,
            context_tools: vec!["srv:read_json".to_string()],
            ..SearchOptions::default()
        };
        let hits = registry.search("parse configuration", &opts).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert!(ids.contains(&"srv:read_json"));
        assert!(ids.contains(&"srv:create_memory"));
        let memory_hit = hits.iter().find(|h| h.id == "srv:create_memory").unwrap();
        assert!(memory_hit.relatedness > 0.0);
    }

    #[tokio::test]
    async fn limit_truncates_results() {
        let registry = registry_with_tools().await;
        let opts = SearchOptions {
            limit: 1,
            ..SearchOptions::default()
        };
        let hits = registry.search("files", &opts).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn zero_limit_returns_nothing() {
        let registry = registry_with_tools().await;
        let opts = SearchOptions {
            limit: 0,
            ..SearchOptions::default()
        };
        assert!(registry.search("files", &opts).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn include_related_injects_graph_neighbors() {
        let registry = registry_with_tools().await;
        registry
            .graph()
            .set_edge("srv:read_json", "srv:create_memory", EdgeKind::Related, 4.0);
        let opts = SearchOptions {
            limit: 2,
            include_related: true,
            context_tools: vec!["srv:read_json".to_string()],
            ..SearchOptions::default()
        };
        let hits = registry.search("json configuration", &opts).await.unwrap();
        // Up to limit/2 related extras may follow the top list.
        assert!(hits.len() <= 3);
    }

    #[tokio::test]
    async fn capability_search_only_returns_capabilities() {
        let registry = registry_with_tools().await;
        registry
            .upsert_capability(Capability::new(
                "cap-sync",
                "synchronize configuration to memory",
                json!({"tasks": []}),
            ))
            .await
            .unwrap();

        let hits = registry
            .search_capabilities("synchronize configuration", 5)
            .await
            .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.kind == EntityKind::Capability));
    }
}
