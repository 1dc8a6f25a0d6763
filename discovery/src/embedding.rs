//! Embedding provider seam.
//!
//! Model inference is an external collaborator; the gateway only needs
//! "text in, fixed-dimension vector out". The feature-hashing embedder
//! below is the offline/test implementation: deterministic, dependency-free
//! and good enough for lexical overlap to dominate ranking.

use async_trait::async_trait;

use tmg_wire::GatewayResult;

/// Dimension used by the built-in embedder. External providers may use any
/// dimension; the vector store only requires consistency per provider.
pub const EMBED_DIM: usize = 256;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed one document or query.
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>>;

    fn dimension(&self) -> usize;
}

/// Deterministic feature-hashing embedder: tokens are hashed into a fixed
/// number of buckets with term-frequency weights, then L2-normalized.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dim: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self { dim: EMBED_DIM }
    }
}

impl HashingEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn bucket(&self, token: &str) -> usize {
        // FNV-1a; stable across platforms and runs.
        let mut hash: u64 = 0xcbf29ce484222325;
        for byte in token.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x100000001b3);
        }
        (hash % self.dim as u64) as usize
    }

    fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for token in tokenize(text) {
            vector[self.bucket(&token)] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbedder {
    async fn embed(&self, text: &str) -> GatewayResult<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimension(&self) -> usize {
        self.dim
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
}

/// Cosine similarity between two vectors of equal dimension.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
