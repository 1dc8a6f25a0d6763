//! Canonical catalog of tool descriptors and capabilities.
//!
//! Readers get copy-on-write snapshots; writers clone, modify and swap the
//! snapshot atomically. Embedding and vector upserts happen on the write
//! path, gated by content hash so unchanged descriptors are never
//! re-embedded.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tmg_wire::GatewayResult;

use crate::capability::Capability;
use crate::descriptor::{DescriptorSink, ToolDescriptor};
use crate::embedding::EmbeddingProvider;
use crate::graph::{KnowledgeGraph, NodeKind};
use crate::vector::{EntityKind, VectorStore};

/// Immutable view of the catalog at one point in time.
#[derive(Default, Clone)]
pub struct CatalogSnapshot {
    /// Keyed by the rendered qualified name `server:tool`.
    pub tools: HashMap<String, ToolDescriptor>,
    pub capabilities: HashMap<String, Capability>,
}

pub struct Registry {
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    graph: Arc<KnowledgeGraph>,
}

impl Registry {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        graph: Arc<KnowledgeGraph>,
    ) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            embedder,
            vectors,
            graph,
        }
    }

    pub fn snapshot(&self) -> Arc<CatalogSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn graph(&self) -> Arc<KnowledgeGraph> {
        Arc::clone(&self.graph)
    }

    pub(crate) fn embedder(&self) -> &dyn EmbeddingProvider {
        self.embedder.as_ref()
    }

    pub(crate) fn vectors(&self) -> &dyn VectorStore {
        self.vectors.as_ref()
    }

    pub fn get_tool(&self, qualified: &str) -> Option<ToolDescriptor> {
        self.snapshot().tools.get(qualified).cloned()
    }

    pub fn get_capability(&self, id: &str) -> Option<Capability> {
        self.snapshot().capabilities.get(id).cloned()
    }

    /// Expand a capability into its plan blob for engine submission.
    pub fn expand_capability(&self, id: &str) -> Option<serde_json::Value> {
        self.get_capability(id).map(|cap| cap.plan)
    }

    pub fn counts(&self) -> (usize, usize) {
        let snapshot = self.snapshot();
        (snapshot.tools.len(), snapshot.capabilities.len())
    }

    /// Replace one server's descriptor set, re-embedding entries whose
    /// content hash changed. Embedding failures degrade search for the
    /// affected tools but never block catalog publication.
    pub async fn apply_server_tools(&self, server: &str, descriptors: Vec<ToolDescriptor>) {
        let previous = self.snapshot();
        let mut tools = previous.tools.clone();
        let prefix = format!("{}:", server);
        let incoming: HashMap<String, &ToolDescriptor> = descriptors
            .iter()
            .map(|d| (d.name.to_string(), d))
            .collect();

        let removed: Vec<String> = tools
            .keys()
            .filter(|id| id.starts_with(&prefix) && !incoming.contains_key(*id))
            .cloned()
            .collect();
        for id in &removed {
            tools.remove(id);
            if let Err(e) = self.vectors.remove(id).await {
                warn!(tool = %id, error = %e, "failed to drop stale vector");
            }
        }

        let mut changed = 0usize;
        for descriptor in &descriptors {
            let id = descriptor.name.to_string();
            let stale = self
                .vectors
                .content_hash(&id)
                .await
                .is_none_or(|hash| hash != descriptor.content_hash);
            if stale {
                match self.embedder.embed(&descriptor.document()).await {
                    Ok(vector) => {
                        if let Err(e) = self
                            .vectors
                            .upsert(&id, EntityKind::Tool, vector, &descriptor.content_hash)
                            .await
                        {
                            warn!(tool = %id, error = %e, "vector upsert failed");
                        }
                        changed += 1;
                    }
                    Err(e) => warn!(tool = %id, error = %e, "embedding failed"),
                }
            }
            self.graph.ensure_node(&id, NodeKind::Tool);
            tools.insert(id, descriptor.clone());
        }

        let mut next = (*previous).clone();
        next.tools = tools;
        *self.snapshot.write() = Arc::new(next);

        info!(
            server,
            total = descriptors.len(),
            re_embedded = changed,
            removed = removed.len(),
            "descriptor set applied"
        );
    }

    /// Drop every descriptor attributed to a server. Graph nodes are kept:
    /// learned structure stays useful across reconnects.
    pub async fn drop_server_tools(&self, server: &str) {
        let previous = self.snapshot();
        let prefix = format!("{}:", server);
        let removed: Vec<String> = previous
            .tools
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        if removed.is_empty() {
            return;
        }
        let mut next = (*previous).clone();
        for id in &removed {
            next.tools.remove(id);
            if let Err(e) = self.vectors.remove(id).await {
                warn!(tool = %id, error = %e, "failed to drop stale vector");
            }
        }
        *self.snapshot.write() = Arc::new(next);
        debug!(server, count = removed.len(), "server descriptors dropped");
    }

    /// Insert or update a capability, refreshing its embedding and its
    /// `contains` edges.
    pub async fn upsert_capability(&self, capability: Capability) -> GatewayResult<()> {
        let id = capability.id.clone();
        let stale = self
            .vectors
            .content_hash(&id)
            .await
            .is_none_or(|hash| hash != capability.content_hash);
        if stale {
            let vector = self.embedder.embed(&capability.document()).await?;
            self.vectors
                .upsert(&id, EntityKind::Capability, vector, &capability.content_hash)
                .await?;
        }
        self.graph
            .set_capability_contains(&id, &capability.tool_targets());

        let previous = self.snapshot();
        let mut next = (*previous).clone();
        next.capabilities.insert(id, capability);
        *self.snapshot.write() = Arc::new(next);
        Ok(())
    }

    /// Record a capability invocation outcome (success-rate estimate and
    /// reuse counter).
    pub fn record_capability_use(&self, id: &str, success: bool) {
        let previous = self.snapshot();
        let Some(mut capability) = previous.capabilities.get(id).cloned() else {
            return;
        };
        capability.record_use(success);
        let mut next = (*previous).clone();
        next.capabilities.insert(id.to_string(), capability);
        *self.snapshot.write() = Arc::new(next);
    }

    /// Stable hash over the content hashes of the named tools, used in
    /// sandbox cache keys so schema changes invalidate cached results.
    pub fn schema_version_hash(&self, tool_ids: &[String]) -> String {
        let snapshot = self.snapshot();
        let mut hashes: Vec<&str> = tool_ids
            .iter()
            .filter_map(|id| snapshot.tools.get(id).map(|d| d.content_hash.as_str()))
            .collect();
        hashes.sort_unstable();
        tmg_wire::content_hash(&hashes)
    }
}

#[async_trait::async_trait]
impl DescriptorSink for Registry {
    async fn publish(&self, server: &str, tools: Vec<ToolDescriptor>) {
        self.apply_server_tools(server, tools).await;
    }

    async fn remove_server(&self, server: &str) {
        self.drop_server_tools(server).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::vector::InMemoryVectorStore;
    use serde_json::json;
    use tmg_wire::mcp::WireTool;

    fn registry() -> Registry {
        Registry::new(
            Arc::new(HashingEmbedder::default()),
            Arc::new(InMemoryVectorStore::new()),
            Arc::new(KnowledgeGraph::default()),
        )
    }

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

    #[tokio::test]
    async fn publish_populates_catalog_and_graph() {
        let registry = registry();
        registry
            .apply_server_tools("fs", vec![descriptor("fs", "read", "Read a file")])
            .await;

        assert!(registry.get_tool("fs:read").is_some());
        assert_eq!(registry.graph().node_count(), 1);
    }

    #[tokio::test]
    async fn republish_removes_stale_tools() {
        let registry = registry();
        registry
            .apply_server_tools(
                "fs",
                vec![
                    descriptor("fs", "read", "Read"),
                    descriptor("fs", "write", "Write"),
                ],
            )
            .await;
        registry
            .apply_server_tools("fs", vec![descriptor("fs", "read", "Read")])
            .await;

        assert!(registry.get_tool("fs:read").is_some());
        assert!(registry.get_tool("fs:write").is_none());
    }

    #[tokio::test]
    async fn snapshot_is_immutable_under_writes() {
        let registry = registry();
        let before = registry.snapshot();
        registry
            .apply_server_tools("fs", vec![descriptor("fs", "read", "Read")])
            .await;
        assert!(before.tools.is_empty());
        assert_eq!(registry.snapshot().tools.len(), 1);
    }

    #[tokio::test]
    async fn unchanged_descriptors_keep_their_vector_hash() {
        let store = Arc::new(InMemoryVectorStore::new());
        let registry = Registry::new(
            Arc::new(HashingEmbedder::default()),
            Arc::clone(&store) as Arc<dyn VectorStore>,
            Arc::new(KnowledgeGraph::default()),
        );
        let d = descriptor("fs", "read", "Read");
        registry.apply_server_tools("fs", vec![d.clone()]).await;
        let hash_before = store.content_hash("fs:read").await;
        registry.apply_server_tools("fs", vec![d]).await;
        assert_eq!(store.content_hash("fs:read").await, hash_before);
    }

    #[tokio::test]
    async fn capability_upsert_sets_contains_edges() {
        let registry = registry();
        let cap = Capability::new(
            "cap-copy",
            "copy a file",
            json!({"tasks": [
                {"id": "t1", "kind": "tool_call", "target": "fs:read"},
                {"id": "t2", "kind": "tool_call", "target": "fs:write", "dependsOn": ["t1"]}
            ]}),
        );
        registry.upsert_capability(cap).await.unwrap();

        assert!(registry.get_capability("cap-copy").is_some());
        assert!(
            registry
                .graph()
                .edge_weight("cap-copy", "fs:read", crate::graph::EdgeKind::Contains)
                > 0.0
        );
        assert!(registry.expand_capability("cap-copy").is_some());
    }

    #[tokio::test]
    async fn record_use_updates_counters() {
        let registry = registry();
        let cap = Capability::new("cap1", "do things", json!({"tasks": []}));
        registry.upsert_capability(cap).await.unwrap();
        registry.record_capability_use("cap1", true);
        let cap = registry.get_capability("cap1").unwrap();
        assert_eq!(cap.reuse_count, 1);
        assert_eq!(cap.success_rate, 1.0);
    }

    #[tokio::test]
    async fn schema_version_hash_tracks_descriptor_changes() {
        let registry = registry();
        registry
            .apply_server_tools("fs", vec![descriptor("fs", "read", "Read")])
            .await;
        let ids = vec!["fs:read".to_string()];
        let before = registry.schema_version_hash(&ids);
        registry
            .apply_server_tools("fs", vec![descriptor("fs", "read", "Read v2")])
            .await;
        assert_ne!(registry.schema_version_hash(&ids), before);
    }
}
