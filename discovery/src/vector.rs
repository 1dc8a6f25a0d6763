//! Vector store seam and the in-memory default.
//!
//! The persistent store (an embedded vector database) is an external
//! collaborator; the in-memory brute-force store backs tests and small
//! deployments. Both support upsert keyed by entity id and top-k retrieval
//! by cosine similarity.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use tmg_wire::GatewayResult;

use crate::embedding::cosine;

/// What kind of entity a stored vector belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Tool,
    Capability,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredId {
    pub id: String,
    pub kind: EntityKind,
    pub score: f32,
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Insert or replace the vector for an entity.
    async fn upsert(
        &self,
        id: &str,
        kind: EntityKind,
        vector: Vec<f32>,
        content_hash: &str,
    ) -> GatewayResult<()>;

    async fn remove(&self, id: &str) -> GatewayResult<()>;

    /// Content hash recorded at upsert time, used to skip re-embedding.
    async fn content_hash(&self, id: &str) -> Option<String>;

    /// Top-k entities by cosine similarity, optionally restricted to a kind.
    async fn top_k(
        &self,
        query: &[f32],
        k: usize,
        kind: Option<EntityKind>,
    ) -> GatewayResult<Vec<ScoredId>>;
}

struct StoredVector {
    kind: EntityKind,
    vector: Vec<f32>,
    content_hash: String,
}

/// Brute-force cosine store over a concurrent map.
#[derive(Default)]
pub struct InMemoryVectorStore {
    entries: DashMap<String, StoredVector>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn upsert(
        &self,
        id: &str,
        kind: EntityKind,
        vector: Vec<f32>,
        content_hash: &str,
    ) -> GatewayResult<()> {
        self.entries.insert(
            id.to_string(),
            StoredVector {
                kind,
                vector,
                content_hash: content_hash.to_string(),
            },
        );
        Ok(())
    }

    async fn remove(&self, id: &str) -> GatewayResult<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn content_hash(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|e| e.content_hash.clone())
    }

    async fn top_k(
        &self,
        query: &[f32],
        k: usize,
        kind: Option<EntityKind>,
    ) -> GatewayResult<Vec<ScoredId>> {
        let mut scored: Vec<ScoredId> = self
            .entries
            .iter()
            .filter(|entry| kind.is_none_or(|want| entry.kind == want))
            .map(|entry| ScoredId {
                id: entry.key().clone(),
                kind: entry.kind,
                score: cosine(query, &entry.vector),
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn top_k_ranks_by_similarity() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", EntityKind::Tool, vec![1.0, 0.0], "h1")
            .await
            .unwrap();
        store
            .upsert("b", EntityKind::Tool, vec![0.0, 1.0], "h2")
            .await
            .unwrap();

        let hits = store.top_k(&[1.0, 0.1], 2, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn kind_filter_excludes_other_entities() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("tool", EntityKind::Tool, vec![1.0, 0.0], "h1")
            .await
            .unwrap();
        store
            .upsert("cap", EntityKind::Capability, vec![1.0, 0.0], "h2")
            .await
            .unwrap();

        let hits = store
            .top_k(&[1.0, 0.0], 10, Some(EntityKind::Capability))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "cap");
    }

    #[tokio::test]
    async fn upsert_replaces_vector_and_hash() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", EntityKind::Tool, vec![1.0, 0.0], "h1")
            .await
            .unwrap();
        store
            .upsert("a", EntityKind::Tool, vec![0.0, 1.0], "h2")
            .await
            .unwrap();

        assert_eq!(store.content_hash("a").await.as_deref(), Some("h2"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn remove_deletes_entry() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("a", EntityKind::Tool, vec![1.0], "h")
            .await
            .unwrap();
        store.remove("a").await.unwrap();
        assert!(store.is_empty());
        assert!(store.content_hash("a").await.is_none());
    }

    #[tokio::test]
    async fn ties_break_by_id() {
        let store = InMemoryVectorStore::new();
        store
            .upsert("z", EntityKind::Tool, vec![1.0, 0.0], "h")
            .await
            .unwrap();
        store
            .upsert("a", EntityKind::Tool, vec![1.0, 0.0], "h")
            .await
            .unwrap();

        let hits = store.top_k(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(hits[0].id, "a");
    }
}
