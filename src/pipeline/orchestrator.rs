// pipeline/orchestrator.rs
// Sequences embedding -> indexing -> clustering -> scoring for one run

use crate::config::Settings;
use crate::error::{PipelineError, Result};
use crate::graph::{builder::build_graph, GraphStats, NodeResolver};
use crate::pipeline::artifact::{ArtifactStore, ANALYSIS_FILE, CLUSTERING_FILE};
use crate::pipeline::cluster::{
    cluster_embeddings, Cluster, ClusteringMethod, ProjectedPoint, ProjectionMethod,
};
use crate::pipeline::embed::{EmbeddingOrchestrator, EmbeddingSet};
use crate::pipeline::index::find_semantic_neighbors;
use crate::pipeline::ingest::{Page, PageSet};
use crate::pipeline::run::{RunHandle, RunStatus};
use crate::pipeline::score::{
    cluster_coherence, score_proximities, summarize, AnalysisSummary, ClusterCoherence,
    ProximityAnomaly,
};
use crate::provider::VectorProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything a finished run produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub project_id: String,
    pub total_pages: usize,
    pub dimensions: usize,
    pub clusters: Vec<Cluster>,
    /// Sorted by descending anomaly score
    pub proximities: Vec<ProximityAnomaly>,
    pub projection_2d: Vec<ProjectedPoint>,
    pub cluster_coherence: Vec<ClusterCoherence>,
    pub summary: AnalysisSummary,
    pub graph_stats: GraphStats,
    pub clustering_method: ClusteringMethod,
    pub projection_method: ProjectionMethod,
    pub noise_points: usize,
    pub embeddings_path: PathBuf,
    pub completed_at: DateTime<Utc>,
}

impl AnalysisResult {
    /// Proximities with `cosine >= min_sim` and a known `hops >= min_hops`
    pub fn filter_proximities(
        &self,
        min_sim: Option<f32>,
        min_hops: Option<usize>,
    ) -> Vec<&ProximityAnomaly> {
        self.proximities
            .iter()
            .filter(|p| min_sim.map_or(true, |min| p.cosine >= min))
            .filter(|p| min_hops.map_or(true, |min| p.hops.map_or(false, |h| h >= min)))
            .collect()
    }
}

/// Runs the analysis pipeline against a vectorization provider
pub struct Analyzer {
    provider: Arc<dyn VectorProvider>,
    settings: Settings,
    store: ArtifactStore,
}

impl Analyzer {
    pub fn new(provider: Arc<dyn VectorProvider>, settings: Settings) -> Self {
        let store = ArtifactStore::new(settings.data_dir.clone());
        Self {
            provider,
            settings,
            store,
        }
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Run every stage, recording progress on `handle`.
    ///
    /// On error the run is moved to `failed` before the error is returned.
    pub async fn run(&self, pages: PageSet, handle: &RunHandle) -> Result<Arc<AnalysisResult>> {
        match self.execute(pages, handle).await {
            Ok(result) => Ok(result),
            Err(e) => {
                handle.fail(&e);
                Err(e)
            }
        }
    }

    async fn execute(&self, input: PageSet, handle: &RunHandle) -> Result<Arc<AnalysisResult>> {
        let project_id = handle.project_id();
        let total_start = Instant::now();
        let total_pages = input.len();

        // Stage 1: embeddings
        checkpoint(handle, "embedding")?;
        handle.enter(
            RunStatus::Embedding,
            format!("Generating embeddings for {} pages", total_pages),
        )?;
        let (embeddings, embeddings_path) = self.embeddings(&project_id, &input.pages, handle).await?;
        let embeddings = Arc::new(embeddings);

        // Stage 2: semantic neighbors
        checkpoint(handle, "indexing")?;
        handle.enter(RunStatus::Indexing, "Computing semantic similarities")?;
        let neighbors = {
            let embeddings = embeddings.clone();
            let config = self.settings.index.clone();
            tokio::task::spawn_blocking(move || find_semantic_neighbors(&embeddings, &config)).await?
        };

        // Stage 3: clustering
        checkpoint(handle, "clustering")?;
        handle.enter(RunStatus::Clustering, "Analyzing clusters")?;
        let clustering = {
            let embeddings = embeddings.clone();
            let texts: Vec<String> = input.pages.iter().map(|p| p.content.clone()).collect();
            let config = self.settings.cluster.clone();
            tokio::task::spawn_blocking(move || cluster_embeddings(&embeddings, &texts, &config)).await?
        };
        self.store.save_json(&project_id, CLUSTERING_FILE, &clustering)?;

        // Stage 4: anomaly scoring
        checkpoint(handle, "scoring")?;
        handle.enter(RunStatus::Scoring, "Computing proximity anomalies")?;
        let scored = {
            let embeddings = embeddings.clone();
            let edges = input.edges.clone();
            let clusters = clustering.clusters.clone();
            let config = self.settings.scoring.clone();
            tokio::task::spawn_blocking(move || {
                let graph = build_graph(&edges);
                let resolver = NodeResolver::new(&embeddings.node_ids, &embeddings.urls);
                let proximities = score_proximities(&neighbors, &graph, &resolver, &config);
                let coherence = cluster_coherence(&clusters, &graph);
                let summary = summarize(embeddings.len(), neighbors.len(), &proximities, &coherence);
                (proximities, coherence, summary, graph.stats())
            })
            .await?
        };
        let (proximities, coherence, summary, graph_stats) = scored;

        let result = Arc::new(AnalysisResult {
            project_id: project_id.clone(),
            total_pages,
            dimensions: embeddings.dimensions(),
            clusters: clustering.clusters,
            proximities,
            projection_2d: clustering.projection,
            cluster_coherence: coherence,
            summary,
            graph_stats,
            clustering_method: clustering.method_used,
            projection_method: clustering.projection_method,
            noise_points: clustering.noise_points,
            embeddings_path,
            completed_at: Utc::now(),
        });

        self.store.save_json(&project_id, ANALYSIS_FILE, result.as_ref())?;
        handle.complete(result.clone())?;

        info!(
            "[{}] Analysis complete in {:.2}s: {} clusters, {} anomalies",
            project_id,
            total_start.elapsed().as_secs_f32(),
            result.clusters.len(),
            result.proximities.len()
        );

        Ok(result)
    }

    /// Reuse a matching artifact when allowed, otherwise call the provider
    async fn embeddings(
        &self,
        project_id: &str,
        pages: &[Page],
        handle: &RunHandle,
    ) -> Result<(EmbeddingSet, PathBuf)> {
        if self.settings.reuse_embeddings {
            match self.store.read_embeddings(project_id) {
                Ok(Some(set)) if set.matches(pages) => {
                    info!("[{}] Reusing {} stored embeddings", project_id, set.len());
                    return Ok((set, self.store.embeddings_path(project_id)?));
                }
                Ok(Some(_)) => info!("[{}] Stored embeddings are stale, recomputing", project_id),
                Ok(None) => {}
                Err(e) => warn!("[{}] Could not read stored embeddings ({}), recomputing", project_id, e),
            }
        }

        let orchestrator = EmbeddingOrchestrator::new(self.provider.clone(), &self.settings.embedding);
        let set = orchestrator
            .embed_pages(pages, |batch| handle.report_batch(batch), handle.cancel_flag())
            .await?;
        let path = self.store.write_embeddings(project_id, &set)?;
        Ok((set, path))
    }
}

/// Stop before `stage` when the run has been revoked
fn checkpoint(handle: &RunHandle, stage: &'static str) -> Result<()> {
    if handle.is_revoked() {
        return Err(PipelineError::Cancelled { stage });
    }
    Ok(())
}
