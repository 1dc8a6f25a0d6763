//! Knowledge graph over tools and capabilities.
//!
//! Edges are learned from observed executions and decayed over time. Reads
//! (ranking queries) take a shared lock; trace folding takes the write lock
//! and is idempotent per trace id so replayed traces never double-count.

mod pagerank;

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use pagerank::power_iteration;

/// Default weight decay multiplier applied once per update cycle.
pub const DEFAULT_DECAY_LAMBDA: f64 = 0.99;
/// Edges below this weight are dropped during decay.
pub const WEIGHT_EPSILON: f64 = 0.05;
/// PageRank is recomputed after this many folds.
const RANK_SAMPLE_EVERY: usize = 10;
/// Bound on the replay-protection window.
const SEEN_TRACE_CAP: usize = 4096;

pub const PAGERANK_DAMPING: f64 = 0.85;
pub const PAGERANK_TOLERANCE: f64 = 1e-6;
pub const PAGERANK_MAX_ITERATIONS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Tool,
    Capability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// B frequently executed after A. Directed.
    Sequence,
    /// Capability uses tool. Directed, set on materialization.
    Contains,
    /// B consumed A's output in a workflow. Directed.
    Dependency,
    /// Co-occurrence regardless of order. Undirected.
    Related,
}

impl EdgeKind {
    fn directed(self) -> bool {
        !matches!(self, EdgeKind::Related)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    src: String,
    dst: String,
    kind: EdgeKind,
}

impl EdgeKey {
    /// Undirected edges are stored under a canonical ordering.
    fn new(src: &str, dst: &str, kind: EdgeKind) -> Self {
        if !kind.directed() && src > dst {
            Self {
                src: dst.to_string(),
                dst: src.to_string(),
                kind,
            }
        } else {
            Self {
                src: src.to_string(),
                dst: dst.to_string(),
                kind,
            }
        }
    }
}

/// Edge deltas distilled from one completed workflow trace.
#[derive(Debug, Clone, Default)]
pub struct TraceFold {
    /// Unique id of the source trace; duplicate folds are no-ops.
    pub trace_id: String,
    /// Targets in execution order.
    pub executed_path: Vec<String>,
    /// `(producer, consumer)` pairs where the consumer used the producer's
    /// output.
    pub dependency_pairs: Vec<(String, String)>,
}

/// Persisted shape for one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub kind: NodeKind,
}

/// Persisted shape for one edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub src: String,
    pub dst: String,
    pub kind: EdgeKind,
    pub weight: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct EdgeState {
    weight: f64,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<String, NodeKind>,
    edges: HashMap<EdgeKey, EdgeState>,
    seen_traces: HashSet<String>,
    seen_order: VecDeque<String>,
    folds_since_rank: usize,
    pagerank: HashMap<String, f64>,
}

impl GraphInner {
    fn bump(&mut self, src: &str, dst: &str, kind: EdgeKind, delta: f64) {
        if src == dst {
            return;
        }
        let state = self
            .edges
            .entry(EdgeKey::new(src, dst, kind))
            .or_insert(EdgeState {
                weight: 0.0,
                updated_at: Utc::now(),
            });
        state.weight += delta;
        state.updated_at = Utc::now();
    }

    fn decay(&mut self, lambda: f64) {
        self.edges.retain(|_, state| {
            state.weight *= lambda;
            state.weight >= WEIGHT_EPSILON
        });
    }

    /// Undirected neighbor sets over the related ∪ sequence projection.
    fn projection_neighbors(&self) -> HashMap<&str, HashSet<&str>> {
        let mut neighbors: HashMap<&str, HashSet<&str>> = HashMap::new();
        for key in self.edges.keys() {
            if matches!(key.kind, EdgeKind::Related | EdgeKind::Sequence) {
                neighbors.entry(&key.src).or_default().insert(&key.dst);
                neighbors.entry(&key.dst).or_default().insert(&key.src);
            }
        }
        neighbors
    }

    fn recompute_pagerank(&mut self) {
        let ids: Vec<String> = self.nodes.keys().cloned().collect();
        if ids.is_empty() {
            self.pagerank.clear();
            return;
        }
        let index: HashMap<&str, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        // Weighted directed links; related edges contribute both directions.
        let mut links: Vec<Vec<(usize, f64)>> = vec![Vec::new(); ids.len()];
        for (key, state) in &self.edges {
            let (Some(&src), Some(&dst)) = (index.get(key.src.as_str()), index.get(key.dst.as_str()))
            else {
                continue;
            };
            links[src].push((dst, state.weight));
            if !key.kind.directed() {
                links[dst].push((src, state.weight));
            }
        }

        let scores = power_iteration(
            &links,
            PAGERANK_DAMPING,
            PAGERANK_TOLERANCE,
            PAGERANK_MAX_ITERATIONS,
        );
        self.pagerank = ids.into_iter().zip(scores).collect();
    }
}

/// Thread-safe knowledge graph. The write path is serialized by a single
/// lock; graphs stay small (one node per tool/capability) so folds and
/// queries are cheap.
pub struct KnowledgeGraph {
    inner: RwLock<GraphInner>,
    decay_lambda: f64,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        Self::new(DEFAULT_DECAY_LAMBDA)
    }
}

impl KnowledgeGraph {
    pub fn new(decay_lambda: f64) -> Self {
        Self {
            inner: RwLock::new(GraphInner::default()),
            decay_lambda,
        }
    }

    pub fn ensure_node(&self, id: &str, kind: NodeKind) {
        let mut inner = self.inner.write();
        inner.nodes.entry(id.to_string()).or_insert(kind);
    }

    pub fn remove_node(&self, id: &str) {
        let mut inner = self.inner.write();
        inner.nodes.remove(id);
        inner.edges.retain(|key, _| key.src != id && key.dst != id);
        inner.pagerank.remove(id);
    }

    pub fn node_count(&self) -> usize {
        self.inner.read().nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.inner.read().edges.len()
    }

    /// Current weight of an edge, 0.0 when absent.
    pub fn edge_weight(&self, src: &str, dst: &str, kind: EdgeKind) -> f64 {
        self.inner
            .read()
            .edges
            .get(&EdgeKey::new(src, dst, kind))
            .map_or(0.0, |state| state.weight)
    }

    /// Seed an edge directly. Used when importing persisted graphs and by
    /// tests.
    pub fn set_edge(&self, src: &str, dst: &str, kind: EdgeKind, weight: f64) {
        let mut inner = self.inner.write();
        inner.nodes.entry(src.to_string()).or_insert(NodeKind::Tool);
        inner.nodes.entry(dst.to_string()).or_insert(NodeKind::Tool);
        inner.edges.insert(
            EdgeKey::new(src, dst, kind),
            EdgeState {
                weight,
                updated_at: Utc::now(),
            },
        );
        inner.recompute_pagerank();
    }

    /// Replace a capability's `contains` edges with the given tool set.
    pub fn set_capability_contains(&self, capability_id: &str, tools: &[String]) {
        let mut inner = self.inner.write();
        inner
            .nodes
            .entry(capability_id.to_string())
            .or_insert(NodeKind::Capability);
        inner
            .edges
            .retain(|key, _| !(key.kind == EdgeKind::Contains && key.src == capability_id));
        for tool in tools {
            inner.nodes.entry(tool.clone()).or_insert(NodeKind::Tool);
            inner.bump(capability_id, tool, EdgeKind::Contains, 1.0);
        }
    }

    /// Fold one completed trace into edge deltas. Returns false when the
    /// trace id was already applied.
    pub fn fold_trace(&self, fold: &TraceFold) -> bool {
        let mut inner = self.inner.write();
        if inner.seen_traces.contains(&fold.trace_id) {
            debug!(trace_id = %fold.trace_id, "duplicate trace fold ignored");
            return false;
        }

        for target in &fold.executed_path {
            inner.nodes.entry(target.clone()).or_insert(NodeKind::Tool);
        }

        for pair in fold.executed_path.windows(2) {
            inner.bump(&pair[0], &pair[1], EdgeKind::Sequence, 1.0);
        }
        for (producer, consumer) in &fold.dependency_pairs {
            inner.nodes.entry(producer.clone()).or_insert(NodeKind::Tool);
            inner.nodes.entry(consumer.clone()).or_insert(NodeKind::Tool);
            inner.bump(producer, consumer, EdgeKind::Dependency, 1.0);
        }

        let distinct: Vec<String> = {
            let mut seen = HashSet::new();
            fold.executed_path
                .iter()
                .filter(|t| seen.insert(t.as_str()))
                .cloned()
                .collect()
        };
        for i in 0..distinct.len() {
            for j in (i + 1)..distinct.len() {
                inner.bump(&distinct[i], &distinct[j], EdgeKind::Related, 1.0);
            }
        }

        inner.decay(self.decay_lambda);

        inner.seen_traces.insert(fold.trace_id.clone());
        inner.seen_order.push_back(fold.trace_id.clone());
        if inner.seen_order.len() > SEEN_TRACE_CAP {
            if let Some(evicted) = inner.seen_order.pop_front() {
                inner.seen_traces.remove(&evicted);
            }
        }

        inner.folds_since_rank += 1;
        if inner.folds_since_rank >= RANK_SAMPLE_EVERY || inner.pagerank.is_empty() {
            inner.recompute_pagerank();
            inner.folds_since_rank = 0;
        }
        true
    }

    /// Adamic-Adar index between two nodes over the undirected projection of
    /// related ∪ sequence edges.
    pub fn adamic_adar(&self, a: &str, b: &str) -> f64 {
        let inner = self.inner.read();
        let neighbors = inner.projection_neighbors();
        let (Some(na), Some(nb)) = (neighbors.get(a), neighbors.get(b)) else {
            return 0.0;
        };
        na.intersection(nb)
            .map(|shared| {
                let degree = neighbors.get(*shared).map_or(0, HashSet::len);
                if degree >= 2 {
                    1.0 / (degree as f64).ln()
                } else {
                    0.0
                }
            })
            .sum()
    }

    /// Relatedness of a candidate with respect to a context set: summed
    /// Adamic-Adar plus direct related/sequence edge weight, so that a
    /// strong direct co-occurrence counts even without shared neighbors.
    pub fn relatedness(&self, candidate: &str, context: &[String]) -> f64 {
        if context.is_empty() {
            return 0.0;
        }
        let direct: f64 = {
            let inner = self.inner.read();
            context
                .iter()
                .map(|ctx| {
                    inner
                        .edges
                        .get(&EdgeKey::new(candidate, ctx, EdgeKind::Related))
                        .map_or(0.0, |state| state.weight)
                        + inner
                            .edges
                            .get(&EdgeKey::new(ctx, candidate, EdgeKind::Sequence))
                            .map_or(0.0, |state| state.weight)
                })
                .sum()
        };
        let shared: f64 = context
            .iter()
            .map(|ctx| self.adamic_adar(candidate, ctx))
            .sum();
        direct + shared
    }

    /// Structural prior from the last sampled PageRank computation.
    pub fn pagerank_score(&self, id: &str) -> f64 {
        self.inner.read().pagerank.get(id).copied().unwrap_or(0.0)
    }

    /// Weighted dependency successors of a node, strongest first. Used by
    /// the DAG suggester to chain tools.
    pub fn dependency_successors(&self, id: &str) -> Vec<(String, f64)> {
        let inner = self.inner.read();
        let mut successors: Vec<(String, f64)> = inner
            .edges
            .iter()
            .filter(|(key, _)| key.kind == EdgeKind::Dependency && key.src == id)
            .map(|(key, state)| (key.dst.clone(), state.weight))
            .collect();
        successors.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        successors
    }

    /// Persisted node shapes.
    pub fn export_nodes(&self) -> Vec<NodeRecord> {
        self.inner
            .read()
            .nodes
            .iter()
            .map(|(id, kind)| NodeRecord {
                id: id.clone(),
                kind: *kind,
            })
            .collect()
    }

    /// Persisted edge shapes.
    pub fn export_edges(&self) -> Vec<EdgeRecord> {
        self.inner
            .read()
            .edges
            .iter()
            .map(|(key, state)| EdgeRecord {
                src: key.src.clone(),
                dst: key.dst.clone(),
                kind: key.kind,
                weight: state.weight,
                updated_at: state.updated_at,
            })
            .collect()
    }

    /// Warm-start from persisted records.
    pub fn import(&self, nodes: Vec<NodeRecord>, edges: Vec<EdgeRecord>) {
        let mut inner = self.inner.write();
        for node in nodes {
            inner.nodes.insert(node.id, node.kind);
        }
        for edge in edges {
            inner.edges.insert(
                EdgeKey::new(&edge.src, &edge.dst, edge.kind),
                EdgeState {
                    weight: edge.weight,
                    updated_at: edge.updated_at,
                },
            );
        }
        inner.recompute_pagerank();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fold(id: &str, path: &[&str], deps: &[(&str, &str)]) -> TraceFold {
        TraceFold {
            trace_id: id.to_string(),
            executed_path: path.iter().map(|s| s.to_string()).collect(),
            dependency_pairs: deps
                .iter()
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .collect(),
        }
    }

    #[test]
    fn fold_creates_sequence_dependency_and_related_edges() {
        let graph = KnowledgeGraph::default();
        graph.fold_trace(&fold("t1", &["a", "b", "c"], &[("a", "c")]));

        assert!(graph.edge_weight("a", "b", EdgeKind::Sequence) > 0.0);
        assert!(graph.edge_weight("b", "c", EdgeKind::Sequence) > 0.0);
        assert!(graph.edge_weight("a", "c", EdgeKind::Dependency) > 0.0);
        assert!(graph.edge_weight("a", "b", EdgeKind::Related) > 0.0);
        assert!(graph.edge_weight("a", "c", EdgeKind::Related) > 0.0);
    }

    #[test]
    fn related_edges_are_undirected() {
        let graph = KnowledgeGraph::default();
        graph.fold_trace(&fold("t1", &["b", "a"], &[]));
        assert_eq!(
            graph.edge_weight("a", "b", EdgeKind::Related),
            graph.edge_weight("b", "a", EdgeKind::Related)
        );
    }

    #[test]
    fn duplicate_trace_is_idempotent() {
        let graph = KnowledgeGraph::default();
        let f = fold("t1", &["a", "b"], &[]);
        assert!(graph.fold_trace(&f));
        let weight_after_first = graph.edge_weight("a", "b", EdgeKind::Sequence);
        assert!(!graph.fold_trace(&f));
        assert_eq!(graph.edge_weight("a", "b", EdgeKind::Sequence), weight_after_first);
    }

    #[test]
    fn decay_is_monotonic_and_drops_tiny_edges() {
        let graph = KnowledgeGraph::new(0.5);
        graph.fold_trace(&fold("t1", &["a", "b"], &[]));
        let w1 = graph.edge_weight("a", "b", EdgeKind::Sequence);
        graph.fold_trace(&fold("t2", &["c", "d"], &[]));
        let w2 = graph.edge_weight("a", "b", EdgeKind::Sequence);
        assert!(w2 < w1);
        // After enough cycles the edge falls under epsilon and disappears.
        for i in 0..8 {
            graph.fold_trace(&fold(&format!("t{}", i + 3), &["c", "d"], &[]));
        }
        assert_eq!(graph.edge_weight("a", "b", EdgeKind::Sequence), 0.0);
    }

    #[test]
    fn weights_never_go_negative() {
        let graph = KnowledgeGraph::new(0.1);
        graph.fold_trace(&fold("t1", &["a", "b"], &[]));
        for edge in graph.export_edges() {
            assert!(edge.weight >= 0.0);
        }
    }

    #[test]
    fn adamic_adar_rewards_common_neighbors() {
        let graph = KnowledgeGraph::default();
        // a and b share neighbors x and y; a and c share nothing.
        graph.set_edge("a", "x", EdgeKind::Related, 1.0);
        graph.set_edge("b", "x", EdgeKind::Related, 1.0);
        graph.set_edge("a", "y", EdgeKind::Related, 1.0);
        graph.set_edge("b", "y", EdgeKind::Related, 1.0);
        graph.set_edge("c", "z", EdgeKind::Related, 1.0);

        assert!(graph.adamic_adar("a", "b") > graph.adamic_adar("a", "c"));
    }

    #[test]
    fn relatedness_uses_direct_edges_without_shared_neighbors() {
        let graph = KnowledgeGraph::default();
        graph.set_edge("a", "c", EdgeKind::Related, 5.0);
        let rel = graph.relatedness("c", &["a".to_string()]);
        assert!(rel >= 5.0);
    }

    #[test]
    fn pagerank_favors_highly_referenced_nodes() {
        let graph = KnowledgeGraph::default();
        for (i, src) in ["a", "b", "c", "d"].iter().enumerate() {
            graph.fold_trace(&fold(
                &format!("t{}", i),
                &[src, "hub"],
                &[(src, "hub")],
            ));
        }
        // Force a recompute via import of current state.
        graph.import(graph.export_nodes(), graph.export_edges());
        assert!(graph.pagerank_score("hub") > graph.pagerank_score("a"));
    }

    #[test]
    fn cycles_are_permitted() {
        let graph = KnowledgeGraph::default();
        graph.set_edge("a", "b", EdgeKind::Sequence, 1.0);
        graph.set_edge("b", "a", EdgeKind::Dependency, 1.0);
        assert_eq!(graph.edge_count(), 2);
        // PageRank converges despite the cycle.
        assert!(graph.pagerank_score("a") > 0.0);
    }

    #[test]
    fn capability_contains_replaces_previous_set() {
        let graph = KnowledgeGraph::default();
        graph.set_capability_contains("cap1", &["a".to_string(), "b".to_string()]);
        graph.set_capability_contains("cap1", &["c".to_string()]);
        assert_eq!(graph.edge_weight("cap1", "a", EdgeKind::Contains), 0.0);
        assert!(graph.edge_weight("cap1", "c", EdgeKind::Contains) > 0.0);
    }

    #[test]
    fn remove_node_drops_incident_edges() {
        let graph = KnowledgeGraph::default();
        graph.set_edge("a", "b", EdgeKind::Sequence, 1.0);
        graph.remove_node("a");
        assert_eq!(graph.edge_count(), 0);
        assert_eq!(graph.node_count(), 1);
    }

    #[test]
    fn dependency_successors_sorted_by_weight() {
        let graph = KnowledgeGraph::default();
        graph.set_edge("a", "b", EdgeKind::Dependency, 1.0);
        graph.set_edge("a", "c", EdgeKind::Dependency, 3.0);
        let successors = graph.dependency_successors("a");
        assert_eq!(successors[0].0, "c");
        assert_eq!(successors[1].0, "b");
    }
}
