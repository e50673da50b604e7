// End-to-end runs of the analyzer against in-process providers

use async_trait::async_trait;
use site_proximity::config::Settings;
use site_proximity::error::{PipelineError, ProviderError};
use site_proximity::jobs::{JobError, JobRegistry};
use site_proximity::pipeline::artifact::{ANALYSIS_FILE, CLUSTERING_FILE};
use site_proximity::pipeline::cluster::{ClusteringMethod, ClusteringOutput};
use site_proximity::pipeline::embed::EmbeddingConfig;
use site_proximity::pipeline::ingest::{EdgeRecord, Page, PageSet};
use site_proximity::pipeline::{AnalysisResult, Analyzer, RunHandle, RunStatus};
use site_proximity::provider::{EmbeddingItem, VectorProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Answers from a fixed text -> vector table
struct TableProvider {
    vectors: HashMap<String, Vec<f32>>,
    calls: AtomicUsize,
    delay: Duration,
}

impl TableProvider {
    fn new(pages: &[Page], vectors: Vec<Vec<f32>>) -> Self {
        Self {
            vectors: pages
                .iter()
                .map(|p| p.content.clone())
                .zip(vectors)
                .collect(),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl VectorProvider for TableProvider {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        items
            .iter()
            .map(|item| {
                self.vectors
                    .get(&item.value)
                    .cloned()
                    .ok_or_else(|| ProviderError::Rejected {
                        status: 422,
                        body: format!("unknown item {}", item.value),
                    })
            })
            .collect()
    }
}

/// Drops the last vector of every batch
struct ShortProvider;

#[async_trait]
impl VectorProvider for ShortProvider {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(vec![vec![1.0, 0.0]; items.len().saturating_sub(1)])
    }
}

/// Revokes the run it belongs to on the first call
struct RevokingProvider {
    handle: Arc<RunHandle>,
}

#[async_trait]
impl VectorProvider for RevokingProvider {
    async fn embed_batch(&self, items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.handle.revoke();
        Ok(vec![vec![1.0, 0.0, 0.0]; items.len()])
    }
}

/// Fails every request
struct DownProvider;

#[async_trait]
impl VectorProvider for DownProvider {
    async fn embed_batch(&self, _items: &[EmbeddingItem]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Transport("connection refused".to_string()))
    }
}

fn settings(dir: &TempDir, batch_size: usize) -> Settings {
    Settings {
        embedding: EmbeddingConfig {
            batch_size,
            batch_pause: Duration::ZERO,
            ..EmbeddingConfig::default()
        },
        data_dir: dir.path().to_path_buf(),
        ..Settings::default()
    }
}

fn page(url: &str) -> Page {
    Page::new(url, format!("content of {}", url))
}

/// Five pages on five unrelated topics
fn orthogonal_site() -> (Vec<Page>, Vec<Vec<f32>>) {
    let pages: Vec<Page> = (0..5).map(|i| page(&format!("https://site/{}", i))).collect();
    let vectors = (0..5)
        .map(|i| {
            let mut v = vec![0.0; 5];
            v[i] = 1.0;
            v
        })
        .collect();
    (pages, vectors)
}

/// Twenty pages on one topic, split into two link islands of ten.
///
/// Every page links to every other page of its island.
fn two_islands() -> (Vec<Page>, Vec<EdgeRecord>, Vec<Vec<f32>>) {
    let urls: Vec<String> = (0..20)
        .map(|i| {
            let island = if i < 10 { "a" } else { "b" };
            format!("https://site/{}/{}", island, i % 10)
        })
        .collect();
    let pages: Vec<Page> = urls.iter().map(|u| page(u)).collect();

    let vectors = (0..20)
        .map(|i| {
            let mut v = vec![0.0; 21];
            v[0] = 1.0;
            v[i + 1] = 0.1;
            v
        })
        .collect();

    let mut edges = Vec::new();
    for island in [&urls[..10], &urls[10..]] {
        for source in island {
            for target in island {
                if source != target {
                    edges.push(EdgeRecord::new(source.as_str(), target.as_str()));
                }
            }
        }
    }

    (pages, edges, vectors)
}

async fn run(
    provider: Arc<dyn VectorProvider>,
    settings: Settings,
    pages: PageSet,
) -> (Arc<RunHandle>, Option<Arc<AnalysisResult>>) {
    let analyzer = Analyzer::new(provider, settings);
    let handle = RunHandle::new("site");
    let result = analyzer.run(pages, &handle).await.ok();
    (handle, result)
}

#[tokio::test]
async fn unrelated_pages_produce_no_anomalies() {
    let dir = TempDir::new().unwrap();
    let (pages, vectors) = orthogonal_site();
    let provider = Arc::new(TableProvider::new(&pages, vectors));

    let (handle, result) = run(provider, settings(&dir, 2), PageSet::new(pages, vec![]).unwrap()).await;
    let result = result.expect("run should complete");

    let progress = handle.snapshot();
    assert_eq!(progress.status, RunStatus::Completed);
    assert_eq!(progress.step, 4);
    assert_eq!(progress.percentage, 100.0);

    assert_eq!(result.total_pages, 5);
    assert_eq!(result.dimensions, 5);
    assert_eq!(result.clustering_method, ClusteringMethod::KMeans);
    assert!(result.proximities.is_empty());
    assert_eq!(result.summary.proximity_anomalies, 0);
    assert_eq!(result.summary.avg_anomaly_score, 0.0);
    assert_eq!(result.projection_2d.len(), 5);
    assert_eq!(result.graph_stats.total_edges, 0);

    let clustering: ClusteringOutput = Analyzer::new(Arc::new(DownProvider), settings(&dir, 2))
        .store()
        .load_json("site", CLUSTERING_FILE)
        .unwrap()
        .unwrap();
    assert_eq!(clustering.method_used, ClusteringMethod::KMeans);
    assert!(result.embeddings_path.exists());
    assert!(dir.path().join("site").join(ANALYSIS_FILE).exists());
}

#[tokio::test]
async fn similar_pages_without_links_score_zero() {
    let dir = TempDir::new().unwrap();
    let pages: Vec<Page> = (0..5).map(|i| page(&format!("https://site/{}", i))).collect();
    let vectors = (0..5)
        .map(|i| {
            let mut v = vec![1.0, 0.0, 0.0, 0.0, 0.0, 0.0];
            v[i + 1] = 0.1;
            v
        })
        .collect();
    let provider = Arc::new(TableProvider::new(&pages, vectors));

    let (handle, result) = run(provider, settings(&dir, 2), PageSet::new(pages, vec![]).unwrap()).await;
    let result = result.expect("run should complete");

    assert_eq!(handle.status(), RunStatus::Completed);
    // Every page is a neighbor of every other, none reachable by links
    assert_eq!(result.proximities.len(), 20);
    assert!(result.proximities.iter().all(|p| p.hops.is_none()));
    assert!(result.proximities.iter().all(|p| p.anomaly_score == 0.0));
    assert_eq!(result.summary.proximity_anomalies, 20);
    assert_eq!(result.summary.avg_anomaly_score, 0.0);
}

#[tokio::test]
async fn disconnected_islands_score_zero() {
    let dir = TempDir::new().unwrap();
    let (pages, edges, vectors) = two_islands();
    let provider = Arc::new(TableProvider::new(&pages, vectors));

    let (_, result) = run(provider, settings(&dir, 8), PageSet::new(pages, edges).unwrap()).await;
    let result = result.expect("run should complete");

    // Linked pages sit one hop apart and are never reported
    assert_eq!(result.proximities.len(), 200);
    assert!(result.proximities.iter().all(|p| p.hops.is_none()));
    assert!(result.proximities.iter().all(|p| p.anomaly_score == 0.0));
    assert!(result.proximities.iter().all(|p| p.cosine >= 0.8));
    assert_eq!(result.summary.semantic_pairs, 380);
    assert_eq!(result.summary.avg_anomaly_score, 0.0);
    assert_eq!(result.graph_stats.total_nodes, 20);
    assert_eq!(result.graph_stats.total_edges, 180);
}

#[tokio::test]
async fn one_way_bridge_surfaces_distant_pairs() {
    let dir = TempDir::new().unwrap();
    let (pages, mut edges, vectors) = two_islands();
    edges.push(EdgeRecord::new("https://site/a/9", "https://site/b/0"));
    let provider = Arc::new(TableProvider::new(&pages, vectors));

    let (_, result) = run(provider, settings(&dir, 8), PageSet::new(pages, edges).unwrap()).await;
    let result = result.expect("run should complete");

    // a/i -> a/9 -> b/0 -> b/j for i != 9, j != 0; b -> a stays unreachable
    let scored: Vec<_> = result.proximities.iter().filter(|p| p.anomaly_score > 0.0).collect();
    assert_eq!(scored.len(), 81);
    assert!(scored.iter().all(|p| p.hops == Some(3)));
    assert_eq!(result.proximities.len(), 181);

    let top = &result.proximities[0];
    assert!(top.url_i.contains("/a/") && top.url_j.contains("/b/"));
    assert!((top.anomaly_score - top.cosine * 3.0 / 8.0).abs() < 1e-6);
    assert!(result
        .proximities
        .windows(2)
        .all(|w| w[0].anomaly_score >= w[1].anomaly_score));

    assert_eq!(result.filter_proximities(None, Some(3)).len(), 81);
    assert_eq!(result.filter_proximities(Some(0.999), None).len(), 0);
}

#[tokio::test]
async fn short_provider_response_fails_embedding() {
    let dir = TempDir::new().unwrap();
    let (pages, _) = orthogonal_site();

    let (handle, result) = run(
        Arc::new(ShortProvider),
        settings(&dir, 2),
        PageSet::new(pages, vec![]).unwrap(),
    )
    .await;

    assert!(result.is_none());
    let progress = handle.snapshot();
    assert_eq!(progress.status, RunStatus::Failed);
    assert_eq!(progress.step, 1);
    assert!(progress.error.unwrap().contains("1 vectors for 2 items"));
    assert!(handle.result().is_none());
    assert!(!dir.path().join("site").join(ANALYSIS_FILE).exists());
}

#[tokio::test]
async fn revoked_run_stops_between_batches() {
    let dir = TempDir::new().unwrap();
    let (pages, _) = orthogonal_site();
    let handle = RunHandle::new("site");
    let analyzer = Analyzer::new(
        Arc::new(RevokingProvider {
            handle: handle.clone(),
        }),
        settings(&dir, 1),
    );

    let err = analyzer
        .run(PageSet::new(pages, vec![]).unwrap(), &handle)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("cancelled"));
    let progress = handle.snapshot();
    assert_eq!(progress.status, RunStatus::Failed);
    assert_eq!(progress.step, 1);
    assert!(progress.error.unwrap().contains("cancelled"));
}

#[tokio::test]
async fn revoked_before_start_never_calls_provider() {
    let dir = TempDir::new().unwrap();
    let (pages, vectors) = orthogonal_site();
    let provider = Arc::new(TableProvider::new(&pages, vectors));
    let analyzer = Analyzer::new(provider.clone(), settings(&dir, 2));
    let handle = RunHandle::new("site");
    handle.revoke();

    assert!(analyzer.run(PageSet::new(pages, vec![]).unwrap(), &handle).await.is_err());
    assert_eq!(handle.status(), RunStatus::Failed);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn second_start_is_rejected_while_active() {
    let dir = TempDir::new().unwrap();
    let (pages, vectors) = orthogonal_site();
    let provider = TableProvider::new(&pages, vectors).with_delay(Duration::from_millis(200));
    let registry = JobRegistry::new(Analyzer::new(Arc::new(provider), settings(&dir, 1)));
    let input = PageSet::new(pages, vec![]).unwrap();

    registry.start("site", input.clone()).unwrap();
    let err = registry.start("site", input.clone()).unwrap_err();
    assert!(matches!(err, JobError::AlreadyActive { .. }));
    assert!(matches!(
        registry.start("../escape", input.clone()),
        Err(JobError::Pipeline(PipelineError::Input(_)))
    ));

    assert_eq!(registry.wait("site").await.unwrap(), RunStatus::Completed);
    assert!(registry.result("site").unwrap().is_some());

    // A finished run can be replaced
    let handle = registry.start("site", input).unwrap();
    assert_eq!(handle.wait().await, RunStatus::Completed);
}

#[tokio::test]
async fn registry_reports_unknown_projects() {
    let dir = TempDir::new().unwrap();
    let registry = JobRegistry::new(Analyzer::new(Arc::new(DownProvider), settings(&dir, 1)));

    assert!(matches!(registry.progress("nope"), Err(JobError::NotFound(_))));
    assert!(matches!(registry.revoke("nope"), Err(JobError::NotFound(_))));
    assert!(matches!(registry.result("nope"), Err(JobError::NotFound(_))));
}

#[tokio::test]
async fn stored_embeddings_are_reused_when_pages_match() {
    let dir = TempDir::new().unwrap();
    let (pages, vectors) = orthogonal_site();
    let provider = Arc::new(TableProvider::new(&pages, vectors));

    let (_, first) = run(provider, settings(&dir, 2), PageSet::new(pages.clone(), vec![]).unwrap()).await;
    assert!(first.is_some());

    let mut reuse = settings(&dir, 2);
    reuse.reuse_embeddings = true;

    // The provider is down, so only the stored artifact can satisfy the run
    let (handle, second) = run(Arc::new(DownProvider), reuse.clone(), PageSet::new(pages.clone(), vec![]).unwrap()).await;
    assert_eq!(handle.status(), RunStatus::Completed);
    assert_eq!(second.unwrap().dimensions, 5);

    // A different page set invalidates the artifact
    let pages_for_edit = pages.clone();
    let settings_for_edit = reuse.clone();
    let mut changed = pages;
    changed.pop();
    let (handle, third) = run(Arc::new(DownProvider), reuse, PageSet::new(changed, vec![]).unwrap()).await;
    assert!(third.is_none());
    assert!(handle.snapshot().error.unwrap().contains("connection refused"));

    // Same URLs with edited content must not reuse stale vectors
    let mut edited = pages_for_edit;
    edited[0].content = "rewritten".to_string();
    let (handle, fourth) = run(Arc::new(DownProvider), settings_for_edit, PageSet::new(edited, vec![]).unwrap()).await;
    assert!(fourth.is_none());
    assert_eq!(handle.status(), RunStatus::Failed);

    // Registry falls back to the persisted result document
    let registry = JobRegistry::new(Analyzer::new(Arc::new(DownProvider), settings(&dir, 2)));
    let stored = registry.result("site").unwrap().unwrap();
    assert_eq!(stored.total_pages, 5);
}
