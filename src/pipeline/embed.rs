// pipeline/embed.rs
// Phase 1: Embedding generation through the external vectorization provider

use crate::error::{PipelineError, ProviderError, Result};
use crate::pipeline::ingest::{NodeId, Page};
use crate::provider::{EmbeddingItem, VectorProvider};
use ndarray::{Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Configuration for embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Base URL of the embedding service
    pub endpoint: String,

    /// Model name sent with each request
    pub model: String,

    /// Pages per provider call
    pub batch_size: usize,

    /// Per-request timeout
    pub timeout: Duration,

    /// Pause between two provider calls
    pub batch_pause: Duration,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            model: "BAAI/bge-m3".to_string(),
            batch_size: 250,
            timeout: Duration::from_secs(3600),
            batch_pause: Duration::from_millis(100),
        }
    }
}

/// Vectors for a page set, one row per page in page order
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingSet {
    pub node_ids: Vec<NodeId>,
    pub urls: Vec<String>,
    pub vectors: Array2<f32>,
    /// SHA-256 of each row's provider input; empty when unknown
    pub fingerprints: Vec<String>,
}

/// Hex SHA-256 of the item a page is embedded from
pub fn input_fingerprint(page: &Page) -> String {
    let mut hasher = Sha256::new();
    match page.embedding_text() {
        Some(text) => {
            hasher.update(b"text:");
            hasher.update(text.as_bytes());
        }
        None => {
            hasher.update(b"url:");
            hasher.update(page.url.as_bytes());
        }
    }
    format!("{:x}", hasher.finalize())
}

impl EmbeddingSet {
    /// Assemble a set from per-page rows; every row must share one dimension
    pub fn from_rows(node_ids: Vec<NodeId>, urls: Vec<String>, rows: Vec<Vec<f32>>) -> Result<Self> {
        if node_ids.len() != rows.len() || urls.len() != rows.len() {
            return Err(PipelineError::Input(format!(
                "{} vectors for {} node ids and {} urls",
                rows.len(),
                node_ids.len(),
                urls.len()
            )));
        }

        let dimensions = rows.first().map_or(0, Vec::len);
        for (index, row) in rows.iter().enumerate() {
            if row.len() != dimensions {
                return Err(ProviderError::DimensionMismatch {
                    index,
                    expected: dimensions,
                    got: row.len(),
                }
                .into());
            }
        }

        let flat: Vec<f32> = rows.into_iter().flatten().collect();
        let vectors = Array2::from_shape_vec((node_ids.len(), dimensions), flat)
            .map_err(|e| PipelineError::Input(format!("bad embedding shape: {}", e)))?;

        Ok(Self {
            node_ids,
            urls,
            vectors,
            fingerprints: Vec::new(),
        })
    }

    /// Attach per-row input fingerprints
    pub fn with_fingerprints(mut self, fingerprints: Vec<String>) -> Result<Self> {
        if fingerprints.len() != self.len() {
            return Err(PipelineError::Input(format!(
                "{} fingerprints for {} rows",
                fingerprints.len(),
                self.len()
            )));
        }
        self.fingerprints = fingerprints;
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.node_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.node_ids.is_empty()
    }

    /// Dimensionality, detected from the first vector
    pub fn dimensions(&self) -> usize {
        self.vectors.ncols()
    }

    pub fn vector(&self, row: usize) -> ArrayView1<'_, f32> {
        self.vectors.row(row)
    }

    /// Whether this set was computed for exactly these pages, in this
    /// order, from the same inputs. Sets without fingerprints never match.
    pub fn matches(&self, pages: &[Page]) -> bool {
        self.node_ids.len() == pages.len()
            && self.fingerprints.len() == pages.len()
            && self
                .node_ids
                .iter()
                .zip(&self.fingerprints)
                .zip(pages.iter())
                .all(|((id, fingerprint), page)| {
                    *id == page.node_id && *fingerprint == input_fingerprint(page)
                })
    }
}

/// Whether a progress event opens or closes a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Started,
    Finished,
}

/// Progress of the embedding stage, emitted around every provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub phase: BatchPhase,
    /// 1-based batch number
    pub batch_index: usize,
    pub batch_count: usize,
    pub pages_completed: usize,
    pub pages_total: usize,
}

/// Drives the provider batch by batch and assembles the embedding set
pub struct EmbeddingOrchestrator {
    provider: Arc<dyn VectorProvider>,
    batch_size: usize,
    batch_pause: Duration,
}

impl EmbeddingOrchestrator {
    pub fn new(provider: Arc<dyn VectorProvider>, config: &EmbeddingConfig) -> Self {
        Self {
            provider,
            batch_size: config.batch_size.max(1),
            batch_pause: config.batch_pause,
        }
    }

    /// One provider item per page: its content, or its URL when content is blank
    pub fn items_for(pages: &[Page]) -> Vec<EmbeddingItem> {
        pages
            .iter()
            .map(|page| match page.embedding_text() {
                Some(text) => EmbeddingItem::text(text),
                None => EmbeddingItem::url(page.url.clone()),
            })
            .collect()
    }

    /// Generate one vector per page, preserving page order.
    ///
    /// Any failing batch fails the whole stage. `cancel` is checked between
    /// batches.
    pub async fn embed_pages<F>(
        &self,
        pages: &[Page],
        mut on_progress: F,
        cancel: &AtomicBool,
    ) -> Result<EmbeddingSet>
    where
        F: FnMut(BatchProgress),
    {
        let items = Self::items_for(pages);
        let total = items.len();
        let batch_count = (total + self.batch_size - 1) / self.batch_size;
        info!(
            "Embedding {} pages in {} batches of {} via {}",
            total,
            batch_count,
            self.batch_size,
            self.provider.name()
        );

        let total_start = Instant::now();
        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(total);
        let mut dimensions: Option<usize> = None;

        for (batch_idx, chunk) in items.chunks(self.batch_size).enumerate() {
            if batch_idx > 0 {
                if cancel.load(Ordering::SeqCst) {
                    return Err(PipelineError::Cancelled {
                        stage: "next embedding batch",
                    });
                }
                // Hand control back between provider calls
                tokio::time::sleep(self.batch_pause).await;
            }

            let batch_index = batch_idx + 1;
            on_progress(BatchProgress {
                phase: BatchPhase::Started,
                batch_index,
                batch_count,
                pages_completed: rows.len(),
                pages_total: total,
            });

            let batch_start = Instant::now();
            let vectors = self.provider.embed_batch(chunk).await.map_err(|e| {
                error!(
                    "Batch {}/{} failed ({}): {}",
                    batch_index,
                    batch_count,
                    e.kind(),
                    e
                );
                e
            })?;

            if vectors.len() != chunk.len() {
                return Err(ProviderError::CountMismatch {
                    expected: chunk.len(),
                    got: vectors.len(),
                }
                .into());
            }

            for vector in vectors {
                let expected = *dimensions.get_or_insert(vector.len());
                if expected == 0 || vector.len() != expected {
                    return Err(ProviderError::DimensionMismatch {
                        index: rows.len(),
                        expected,
                        got: vector.len(),
                    }
                    .into());
                }
                rows.push(vector);
            }

            info!(
                "Batch {}/{}: {} pages in {:.2}s ({}/{} done)",
                batch_index,
                batch_count,
                chunk.len(),
                batch_start.elapsed().as_secs_f32(),
                rows.len(),
                total
            );

            on_progress(BatchProgress {
                phase: BatchPhase::Finished,
                batch_index,
                batch_count,
                pages_completed: rows.len(),
                pages_total: total,
            });
        }

        info!(
            "Generated {} embeddings ({} dims) in {:.2}s",
            rows.len(),
            dimensions.unwrap_or(0),
            total_start.elapsed().as_secs_f32()
        );

        EmbeddingSet::from_rows(
            pages.iter().map(|p| p.node_id.clone()).collect(),
            pages.iter().map(|p| p.url.clone()).collect(),
            rows,
        )?
        .with_fingerprints(pages.iter().map(input_fingerprint).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{HashingProvider, ItemKind};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Records every batch it receives and answers with hashed vectors
    struct RecordingProvider {
        inner: HashingProvider,
        batches: Mutex<Vec<Vec<EmbeddingItem>>>,
        drop_last: bool,
    }

    impl RecordingProvider {
        fn new(drop_last: bool) -> Self {
            Self {
                inner: HashingProvider::new(8),
                batches: Mutex::new(Vec::new()),
                drop_last,
            }
        }
    }

    #[async_trait]
    impl VectorProvider for RecordingProvider {
        async fn embed_batch(
            &self,
            items: &[EmbeddingItem],
        ) -> std::result::Result<Vec<Vec<f32>>, ProviderError> {
            self.batches.lock().push(items.to_vec());
            let mut vectors = self.inner.embed_batch(items).await?;
            if self.drop_last {
                vectors.pop();
            }
            Ok(vectors)
        }
    }

    fn config(batch_size: usize) -> EmbeddingConfig {
        EmbeddingConfig {
            batch_size,
            batch_pause: Duration::ZERO,
            ..EmbeddingConfig::default()
        }
    }

    fn pages(n: usize) -> Vec<Page> {
        (0..n)
            .map(|i| {
                let content = if i % 2 == 0 { format!("page body {}", i) } else { String::new() };
                Page::new(format!("https://x/{}", i), content)
            })
            .collect()
    }

    #[test]
    fn blank_content_falls_back_to_url() {
        let items = EmbeddingOrchestrator::items_for(&pages(2));
        assert_eq!(items[0].kind, ItemKind::Text);
        assert_eq!(items[0].value, "page body 0");
        assert_eq!(items[1], EmbeddingItem::url("https://x/1"));
    }

    #[tokio::test]
    async fn edited_content_no_longer_matches() {
        let orchestrator = EmbeddingOrchestrator::new(Arc::new(HashingProvider::new(4)), &config(8));
        let mut pages = pages(3);
        let set = orchestrator
            .embed_pages(&pages, |_| {}, &AtomicBool::new(false))
            .await
            .unwrap();
        assert!(set.matches(&pages));

        // Same URL and node id, new body
        pages[1].content = "rewritten".to_string();
        assert!(!set.matches(&pages));

        let bare = EmbeddingSet::from_rows(set.node_ids.clone(), set.urls.clone(), vec![vec![1.0]; 3]).unwrap();
        assert!(!bare.matches(&pages));
        assert!(bare.with_fingerprints(vec!["x".to_string()]).is_err());
    }

    #[tokio::test]
    async fn batches_preserve_order_and_count() {
        let provider = Arc::new(RecordingProvider::new(false));
        let orchestrator = EmbeddingOrchestrator::new(provider.clone(), &config(2));
        let pages = pages(5);
        let mut events = Vec::new();

        let set = orchestrator
            .embed_pages(&pages, |p| events.push(p), &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(set.len(), 5);
        assert_eq!(set.dimensions(), 8);
        assert!(set.matches(&pages));
        let expected = HashingProvider::new(8).vector_for(&EmbeddingItem::url("https://x/3"));
        assert_eq!(set.vector(3).to_vec(), expected);

        let sizes: Vec<usize> = provider.batches.lock().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![2, 2, 1]);

        assert_eq!(events.len(), 6);
        assert_eq!(events[0].phase, BatchPhase::Started);
        assert_eq!(events[0].pages_completed, 0);
        assert_eq!(events[3].batch_index, 2);
        assert_eq!(events[3].pages_completed, 4);
        assert_eq!(events[5].pages_completed, 5);
        assert!(events.iter().all(|e| e.batch_count == 3 && e.pages_total == 5));
    }

    #[tokio::test]
    async fn short_batch_fails_the_stage() {
        let provider = Arc::new(RecordingProvider::new(true));
        let orchestrator = EmbeddingOrchestrator::new(provider, &config(4));

        let err = orchestrator
            .embed_pages(&pages(3), |_| {}, &AtomicBool::new(false))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Provider(ProviderError::CountMismatch {
                expected: 3,
                got: 2
            })
        ));
    }

    #[tokio::test]
    async fn cancellation_stops_before_next_batch() {
        let provider = Arc::new(RecordingProvider::new(false));
        let orchestrator = EmbeddingOrchestrator::new(provider.clone(), &config(1));
        let cancel = AtomicBool::new(false);

        let err = orchestrator
            .embed_pages(&pages(3), |_| cancel.store(true, Ordering::SeqCst), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled { .. }));
        assert_eq!(provider.batches.lock().len(), 1);
    }
}
