// pipeline/cluster.rs
// Phase 3: Topical clustering and 2-D layout of page embeddings

use crate::error::AlgorithmError;
use crate::pipeline::embed::EmbeddingSet;
use crate::pipeline::index::{normalize_rows, IndexConfig, Neighbor, NeighborIndex};
use crate::pipeline::ingest::NodeId;
use crate::pipeline::reduce::{linear_project, manifold_reduce, ManifoldConfig};
use hdbscan::{Hdbscan, HdbscanHyperParams};
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Label assigned to points outside every cluster
pub const NOISE: i32 = -1;

/// Configuration for clustering
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Below this many pages the centroid method is used
    pub density_threshold: usize,

    /// Cap on the intermediate dimension fed to density clustering
    pub max_intermediate_dims: usize,

    /// Neighborhood size for manifold reduction
    pub n_neighbors: usize,

    pub min_dist: f32,

    /// Clusters closer than this in the reduced space are merged
    pub cluster_epsilon: f64,

    /// k-means restarts
    pub n_init: usize,

    pub max_iterations: usize,

    pub tolerance: f32,

    /// Keywords kept per cluster
    pub keyword_count: usize,

    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            density_threshold: 10,
            max_intermediate_dims: 50,
            n_neighbors: 15,
            min_dist: 0.1,
            cluster_epsilon: 0.3,
            n_init: 10,
            max_iterations: 300,
            tolerance: 1e-4,
            keyword_count: 5,
            seed: 42,
        }
    }
}

impl ClusterConfig {
    /// Cluster count for the centroid method: 2 or 3, never more than `n`
    pub fn centroid_k(&self, n: usize) -> usize {
        (n / 2).max(2).min(3).min(n)
    }

    /// Minimum cluster size handed to density clustering
    pub fn min_cluster_size(&self, n: usize) -> usize {
        (n / 15).max(10).min((n / 3).max(3))
    }

    /// Clusters below this size are dropped from the output
    pub fn min_kept_size(&self, n: usize) -> usize {
        (n / 20).max(3)
    }

    pub fn intermediate_dims(&self, n: usize) -> usize {
        self.max_intermediate_dims.min(n.saturating_sub(1)).max(2)
    }

    pub fn neighbors_for(&self, n: usize) -> usize {
        self.n_neighbors.min(n.saturating_sub(1)).max(2)
    }

    fn manifold(&self, n_components: usize, n: usize) -> ManifoldConfig {
        ManifoldConfig {
            n_components,
            n_neighbors: self.neighbors_for(n),
            min_dist: self.min_dist,
            seed: self.seed,
            ..ManifoldConfig::default()
        }
    }
}

/// Which partitioning produced the labels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusteringMethod {
    KMeans,
    Hdbscan,
    /// Density clustering failed and k-means took over
    KMeansFallback,
}

/// Which reducer produced the 2-D layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectionMethod {
    Manifold,
    Linear,
}

/// One topical cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: i32,
    pub size: usize,
    pub centroid: Vec<f32>,
    pub node_ids: Vec<NodeId>,
    pub urls: Vec<String>,
    pub theme: Option<String>,
    pub keywords: Vec<String>,
}

/// A page in the 2-D layout; `cluster` is `None` for noise and dropped clusters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPoint {
    pub node_id: NodeId,
    pub url: String,
    pub x: f32,
    pub y: f32,
    pub cluster: Option<i32>,
}

/// Result of the clustering stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusteringOutput {
    /// Sorted by descending size
    pub clusters: Vec<Cluster>,
    /// One point per page, in page order
    pub projection: Vec<ProjectedPoint>,
    pub method_used: ClusteringMethod,
    pub projection_method: ProjectionMethod,
    pub noise_points: usize,
    pub n_clusters: usize,
}

/// Cluster the pages and lay them out in two dimensions.
///
/// `texts` holds page contents in row order and feeds cluster keywords.
pub fn cluster_embeddings(
    embeddings: &EmbeddingSet,
    texts: &[String],
    config: &ClusterConfig,
) -> ClusteringOutput {
    let n = embeddings.len();
    let start = Instant::now();
    info!("Clustering {} pages", n);

    let mut unit = embeddings.vectors.clone();
    normalize_rows(&mut unit);
    let knn = neighbor_lists(&unit, config.neighbors_for(n));

    let (mut labels, method_used) = if n < config.density_threshold {
        (centroid_or_noise(&embeddings.vectors, n, config), ClusteringMethod::KMeans)
    } else {
        select_labels(density_labels(&unit, &knn, config), || {
            centroid_labels(&embeddings.vectors, config.centroid_k(n), config)
        })
    };
    if labels.len() != n {
        labels = vec![NOISE; n];
    }

    let (coords, projection_method) = project_2d(&unit, &knn, config);

    let noise_points = labels.iter().filter(|&&l| l == NOISE).count();
    let clusters = build_clusters(embeddings, texts, &labels, config);
    let kept: HashSet<i32> = clusters.iter().map(|c| c.cluster_id).collect();

    let projection = (0..n)
        .map(|row| ProjectedPoint {
            node_id: embeddings.node_ids[row].clone(),
            url: embeddings.urls[row].clone(),
            x: coords[[row, 0]],
            y: coords[[row, 1]],
            cluster: Some(labels[row]).filter(|l| kept.contains(l)),
        })
        .collect();

    info!(
        "Found {} clusters ({:?}, {} noise points) in {:.2}s",
        clusters.len(),
        method_used,
        noise_points,
        start.elapsed().as_secs_f32()
    );

    ClusteringOutput {
        n_clusters: clusters.len(),
        clusters,
        projection,
        method_used,
        projection_method,
        noise_points,
    }
}

/// Explicit fallback step: density labels when available, otherwise the
/// centroid method.
pub fn select_labels<F>(
    density: Result<Vec<i32>, AlgorithmError>,
    fallback: F,
) -> (Vec<i32>, ClusteringMethod)
where
    F: FnOnce() -> Result<Vec<i32>, AlgorithmError>,
{
    match density {
        Ok(labels) => (labels, ClusteringMethod::Hdbscan),
        Err(e) => {
            warn!("Density clustering failed ({}), falling back to k-means", e);
            let labels = fallback().unwrap_or_else(|e| {
                warn!("k-means fallback failed ({}), all points left unclustered", e);
                Vec::new()
            });
            (labels, ClusteringMethod::KMeansFallback)
        }
    }
}

fn centroid_or_noise(vectors: &Array2<f32>, n: usize, config: &ClusterConfig) -> Vec<i32> {
    centroid_labels(vectors, config.centroid_k(n), config).unwrap_or_else(|e| {
        warn!("k-means failed ({}), all points left unclustered", e);
        vec![NOISE; n]
    })
}

fn neighbor_lists(unit: &Array2<f32>, k: usize) -> Vec<Vec<Neighbor>> {
    let config = IndexConfig::default();
    NeighborIndex::build(unit, &config).self_neighbors(unit.view(), k)
}

/// Manifold reduction to the intermediate dimension, then HDBSCAN
fn density_labels(
    unit: &Array2<f32>,
    knn: &[Vec<Neighbor>],
    config: &ClusterConfig,
) -> Result<Vec<i32>, AlgorithmError> {
    let n = unit.nrows();
    let dims = config.intermediate_dims(n);
    let reduced = manifold_reduce(unit, knn, &config.manifold(dims, n))?;
    let data: Vec<Vec<f32>> = reduced.rows().into_iter().map(|r| r.to_vec()).collect();

    let min_cluster_size = config.min_cluster_size(n);
    debug!(
        "HDBSCAN over {} dims: min_cluster_size={}, epsilon={}",
        dims, min_cluster_size, config.cluster_epsilon
    );

    let params = HdbscanHyperParams::builder()
        .min_cluster_size(min_cluster_size)
        .min_samples(min_cluster_size)
        .epsilon(config.cluster_epsilon)
        .build();

    // The clusterer can panic on degenerate inputs; treat that as a failure
    let outcome = catch_unwind(AssertUnwindSafe(|| Hdbscan::new(&data, params).cluster()))
        .map_err(|_| AlgorithmError::Density("clusterer panicked".to_string()))?;
    let labels = outcome.map_err(|e| AlgorithmError::Density(e.to_string()))?;

    if labels.len() != n {
        return Err(AlgorithmError::Density(format!(
            "{} labels for {} points",
            labels.len(),
            n
        )));
    }

    Ok(labels)
}

/// Seeded k-means with k-means++ initialization and restarts
fn centroid_labels(
    vectors: &Array2<f32>,
    k: usize,
    config: &ClusterConfig,
) -> Result<Vec<i32>, AlgorithmError> {
    let rows: Vec<&[f32]> = vectors
        .rows()
        .into_iter()
        .map(|r| r.to_slice())
        .collect::<Option<_>>()
        .ok_or_else(|| AlgorithmError::Centroid("non-contiguous rows".to_string()))?;

    let model = KMeans::fit(&rows, k, config)?;
    Ok(model.labels.into_iter().map(|l| l as i32).collect())
}

fn project_2d(
    unit: &Array2<f32>,
    knn: &[Vec<Neighbor>],
    config: &ClusterConfig,
) -> (Array2<f32>, ProjectionMethod) {
    let n = unit.nrows();
    match manifold_reduce(unit, knn, &config.manifold(2, n)) {
        Ok(coords) => (coords, ProjectionMethod::Manifold),
        Err(e) => {
            warn!("2-D manifold projection failed ({}), using linear projection", e);
            let coords = linear_project(unit, 2, config.seed).unwrap_or_else(|e| {
                warn!("Linear projection failed ({}), placing points at the origin", e);
                Array2::zeros((n, 2))
            });
            (coords, ProjectionMethod::Linear)
        }
    }
}

/// Group labels into clusters, drop noise and undersized clusters
fn build_clusters(
    embeddings: &EmbeddingSet,
    texts: &[String],
    labels: &[i32],
    config: &ClusterConfig,
) -> Vec<Cluster> {
    let min_size = config.min_kept_size(embeddings.len());

    let mut groups: BTreeMap<i32, Vec<usize>> = BTreeMap::new();
    for (row, &label) in labels.iter().enumerate() {
        if label != NOISE {
            groups.entry(label).or_default().push(row);
        }
    }

    let mut clusters: Vec<Cluster> = groups
        .into_iter()
        .filter(|(_, rows)| rows.len() >= min_size)
        .map(|(cluster_id, rows)| {
            let keywords = if texts.len() == embeddings.len() {
                top_keywords(rows.iter().map(|&r| texts[r].as_str()), config.keyword_count)
            } else {
                Vec::new()
            };
            let theme = (!keywords.is_empty())
                .then(|| keywords.iter().take(3).cloned().collect::<Vec<_>>().join(", "));

            Cluster {
                cluster_id,
                size: rows.len(),
                centroid: compute_centroid(&embeddings.vectors, &rows),
                node_ids: rows.iter().map(|&r| embeddings.node_ids[r].clone()).collect(),
                urls: rows.iter().map(|&r| embeddings.urls[r].clone()).collect(),
                theme,
                keywords,
            }
        })
        .collect();

    // Stable: equal sizes keep label order
    clusters.sort_by(|a, b| b.size.cmp(&a.size));
    clusters
}

/// Arithmetic mean of the member rows
fn compute_centroid(vectors: &Array2<f32>, rows: &[usize]) -> Vec<f32> {
    if rows.is_empty() {
        return Vec::new();
    }

    let mut centroid = vec![0.0f32; vectors.ncols()];
    for &row in rows {
        for (c, &v) in centroid.iter_mut().zip(vectors.row(row).iter()) {
            *c += v;
        }
    }

    let count = rows.len() as f32;
    for c in &mut centroid {
        *c /= count;
    }

    centroid
}

/// Most frequent keywords across member pages, each page counted once per word
fn top_keywords<'a>(texts: impl Iterator<Item = &'a str>, limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for text in texts {
        let distinct: HashSet<String> = extract_keywords(text).into_iter().collect();
        for word in distinct {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut sorted: Vec<(String, usize)> = counts.into_iter().collect();
    sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    sorted.into_iter().take(limit).map(|(word, _)| word).collect()
}

/// Extract keywords from text
fn extract_keywords(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 2) // Skip very short words
        .map(|w| w.to_lowercase())
        .filter(|w| !is_stopword(w) && !w.chars().all(|c| c.is_ascii_digit()))
        .collect()
}

/// Check if word is a stopword
fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the"
            | "and"
            | "for"
            | "that"
            | "this"
            | "with"
            | "from"
            | "have"
            | "has"
            | "are"
            | "was"
            | "were"
            | "been"
            | "you"
            | "your"
            | "our"
            | "all"
            | "not"
            | "can"
            | "will"
            | "more"
            | "les"
            | "des"
            | "une"
            | "pour"
            | "dans"
            | "est"
            | "sur"
            | "avec"
            | "par"
            | "qui"
            | "que"
            | "pas"
            | "vous"
            | "nous"
            | "plus"
    )
}

/// Lloyd's k-means over raw rows, best inertia over seeded restarts
struct KMeans {
    labels: Vec<usize>,
    inertia: f32,
}

impl KMeans {
    fn fit(vectors: &[&[f32]], k: usize, config: &ClusterConfig) -> Result<Self, AlgorithmError> {
        if vectors.is_empty() {
            return Err(AlgorithmError::TooFewPoints { needed: 1, got: 0 });
        }
        if k == 0 || k > vectors.len() {
            return Err(AlgorithmError::Centroid(format!(
                "k={} for {} points",
                k,
                vectors.len()
            )));
        }

        let mut best: Option<KMeans> = None;
        for init in 0..config.n_init.max(1) {
            let result = Self::fit_single(vectors, k, config, config.seed + init as u64);
            if best.as_ref().map_or(true, |b| result.inertia < b.inertia) {
                best = Some(result);
            }
        }

        best.ok_or_else(|| AlgorithmError::Centroid("no restart converged".to_string()))
    }

    fn fit_single(vectors: &[&[f32]], k: usize, config: &ClusterConfig, seed: u64) -> Self {
        let dims = vectors[0].len();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut centroids = Self::kmeans_plus_plus_init(vectors, k, &mut rng);
        let mut labels = vec![0usize; vectors.len()];
        let mut prev_inertia = f32::MAX;

        for _ in 0..config.max_iterations {
            labels = vectors
                .par_iter()
                .map(|v| nearest(v, &centroids).0)
                .collect();

            let mut sums = vec![vec![0.0f32; dims]; k];
            let mut counts = vec![0usize; k];
            for (v, &c) in vectors.iter().zip(labels.iter()) {
                counts[c] += 1;
                for (s, &x) in sums[c].iter_mut().zip(v.iter()) {
                    *s += x;
                }
            }

            for (c, sum) in sums.iter_mut().enumerate() {
                if counts[c] > 0 {
                    for s in sum.iter_mut() {
                        *s /= counts[c] as f32;
                    }
                } else {
                    // Empty cluster: reseed from a random point
                    *sum = vectors[rng.gen_range(0..vectors.len())].to_vec();
                }
            }
            centroids = sums;

            let inertia = inertia(vectors, &labels, &centroids);
            if (prev_inertia - inertia).abs() < config.tolerance {
                break;
            }
            prev_inertia = inertia;
        }

        labels = vectors.iter().map(|v| nearest(v, &centroids).0).collect();
        let inertia = inertia(vectors, &labels, &centroids);
        Self { labels, inertia }
    }

    fn kmeans_plus_plus_init(vectors: &[&[f32]], k: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f32>> {
        let mut centroids = Vec::with_capacity(k);
        centroids.push(vectors[rng.gen_range(0..vectors.len())].to_vec());

        // Remaining centroids: weighted by squared distance
        for _ in 1..k {
            let distances: Vec<f32> = vectors.iter().map(|v| nearest(v, &centroids).1).collect();
            let total: f32 = distances.iter().sum();

            let selected = if total <= 0.0 {
                rng.gen_range(0..vectors.len())
            } else {
                let threshold = rng.gen::<f32>() * total;
                let mut cumsum = 0.0;
                distances
                    .iter()
                    .position(|&d| {
                        cumsum += d;
                        cumsum >= threshold
                    })
                    .unwrap_or(vectors.len() - 1)
            };

            centroids.push(vectors[selected].to_vec());
        }

        centroids
    }
}

/// Index of the nearest centroid and its squared distance
fn nearest(vector: &[f32], centroids: &[Vec<f32>]) -> (usize, f32) {
    centroids
        .iter()
        .enumerate()
        .map(|(i, c)| (i, squared_euclidean(vector, c)))
        .min_by(|a, b| a.1.total_cmp(&b.1))
        .unwrap_or((0, 0.0))
}

fn inertia(vectors: &[&[f32]], labels: &[usize], centroids: &[Vec<f32>]) -> f32 {
    vectors
        .iter()
        .zip(labels.iter())
        .map(|(v, &c)| squared_euclidean(v, &centroids[c]))
        .sum()
}

fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
