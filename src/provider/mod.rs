//! Vectorization provider seam.
//!
//! The pipeline treats the embedding service as a black box that turns a
//! batch of items into the same number of vectors, in order.

pub mod http;

use crate::error::ProviderError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub use http::HttpVectorProvider;

/// What the item value holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemKind {
    Text,
    Url,
}

/// One input of a vectorization batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub value: String,
}

impl EmbeddingItem {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Text,
            value: value.into(),
        }
    }

    pub fn url(value: impl Into<String>) -> Self {
        Self {
            kind: ItemKind::Url,
            value: value.into(),
        }
    }
}

/// Batch vectorization service.
///
/// Implementations must return exactly one vector per item, in item order.
#[async_trait]
pub trait VectorProvider: Send + Sync {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Identifier recorded in logs
    fn name(&self) -> &str {
        "provider"
    }
}

/// Deterministic offline provider that derives vectors from a content hash.
///
/// Unrelated texts land near-orthogonal; identical texts get identical
/// vectors. Useful for dry runs without an embedding service.
#[derive(Debug, Clone)]
pub struct HashingProvider {
    dimensions: usize,
}

impl HashingProvider {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    /// Generate a unit vector from the item value
    pub fn vector_for(&self, item: &EmbeddingItem) -> Vec<f32> {
        let mut vector = Vec::with_capacity(self.dimensions);
        let mut block = 0u32;

        while vector.len() < self.dimensions {
            let mut hasher = Sha256::new();
            hasher.update(item.value.as_bytes());
            hasher.update(block.to_le_bytes());
            let hash = hasher.finalize();

            for chunk in hash.chunks(4) {
                if vector.len() == self.dimensions {
                    break;
                }
                let val = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                // Centered in [-1, 1)
                vector.push((val % 2000) as f32 / 1000.0 - 1.0);
            }
            block += 1;
        }

        let magnitude: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for v in &mut vector {
                *v /= magnitude;
            }
        }

        vector
    }
}

impl Default for HashingProvider {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl VectorProvider for HashingProvider {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(items.iter().map(|item| self.vector_for(item)).collect())
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_serialize_with_type_tag() {
        let json = serde_json::to_string(&EmbeddingItem::url("https://x/a")).unwrap();
        assert_eq!(json, r#"{"type":"url","value":"https://x/a"}"#);
    }

    #[tokio::test]
    async fn hashing_provider_is_deterministic_and_unit_length() {
        let provider = HashingProvider::new(64);
        let items = vec![
            EmbeddingItem::text("pricing page"),
            EmbeddingItem::text("pricing page"),
            EmbeddingItem::text("careers"),
        ];

        let vectors = provider.embed_batch(&items).await.unwrap();
        assert_eq!(vectors.len(), 3);
        assert_eq!(vectors[0], vectors[1]);
        assert_ne!(vectors[0], vectors[2]);

        let norm: f32 = vectors[2].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
