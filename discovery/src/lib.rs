//! Tool discovery: catalog, embeddings, knowledge graph and hybrid search.
//!
//! The registry owns the canonical descriptor and capability catalog and
//! ranks entries against natural-language queries by combining cosine
//! similarity, graph relatedness and a structural prior. Sessions publish
//! descriptors into it; the DAG engine folds completed traces back into the
//! graph so future rankings improve.

pub mod capability;
pub mod descriptor;
pub mod embedding;
pub mod graph;
pub mod registry;
pub mod search;
pub mod vector;

pub use capability::Capability;
pub use descriptor::{DescriptorSink, QualifiedName, ToolDescriptor};
pub use embedding::{EmbeddingProvider, HashingEmbedder, EMBED_DIM};
pub use graph::{EdgeKind, KnowledgeGraph, NodeKind, TraceFold};
pub use registry::{CatalogSnapshot, Registry};
pub use search::{SearchHit, SearchOptions, SearchWeights};
pub use vector::{EntityKind, InMemoryVectorStore, ScoredId, VectorStore};
