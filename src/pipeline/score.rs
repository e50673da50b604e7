// pipeline/score.rs
// Phase 4: Proximity anomaly scoring and cluster link coherence

use crate::graph::{LinkGraph, NodeResolver};
use crate::pipeline::cluster::Cluster;
use crate::pipeline::index::NeighborPair;
use crate::pipeline::ingest::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

/// Configuration for anomaly scoring
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    /// BFS depth bound and score normalizer
    pub max_hops: usize,

    pub similarity_threshold: f32,

    /// Pairs with fewer hops than this are already well linked
    pub hops_threshold: usize,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            max_hops: 8,
            similarity_threshold: 0.80,
            hops_threshold: 3,
        }
    }
}

/// Semantically close pair and its link distance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProximityAnomaly {
    pub node_i: NodeId,
    pub node_j: NodeId,
    pub url_i: String,
    pub url_j: String,
    pub cosine: f32,
    /// `None` when no path exists within `max_hops`
    pub hops: Option<usize>,
    pub anomaly_score: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterCoherence {
    pub cluster_id: i32,
    pub size: usize,
    pub internal_links: usize,
    pub external_links: usize,
    pub coherence_score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub total_pages: usize,
    /// Neighbor pairs handed to the scorer
    pub semantic_pairs: usize,
    pub proximity_anomalies: usize,
    pub avg_anomaly_score: f32,
    pub clusters_with_links: usize,
    pub avg_cluster_coherence: f32,
}

/// `cosine * min(hops, max_hops) / max_hops`; unreachable pairs score 0
pub fn anomaly_score(cosine: f32, hops: Option<usize>, max_hops: usize) -> f32 {
    match hops {
        Some(hops) if max_hops > 0 => cosine * hops.min(max_hops) as f32 / max_hops as f32,
        _ => 0.0,
    }
}

/// Score every qualifying neighbor pair, highest anomaly first.
///
/// Pairs whose node ids do not resolve to a URL are skipped.
pub fn score_proximities(
    pairs: &[NeighborPair],
    graph: &LinkGraph,
    resolver: &NodeResolver,
    config: &ScoringConfig,
) -> Vec<ProximityAnomaly> {
    let mut skipped = 0usize;
    let mut too_close = 0usize;
    let mut anomalies = Vec::new();

    for pair in pairs {
        if pair.similarity < config.similarity_threshold {
            continue;
        }

        let (Some(url_i), Some(url_j)) = (resolver.url(&pair.node_i), resolver.url(&pair.node_j)) else {
            debug!("Unresolvable pair {} -> {}, skipped", pair.node_i, pair.node_j);
            skipped += 1;
            continue;
        };

        let hops = graph.distance(url_i, url_j, config.max_hops);
        if matches!(hops, Some(h) if h < config.hops_threshold) {
            too_close += 1;
            continue;
        }

        anomalies.push(ProximityAnomaly {
            node_i: pair.node_i.clone(),
            node_j: pair.node_j.clone(),
            url_i: url_i.to_string(),
            url_j: url_j.to_string(),
            cosine: pair.similarity,
            hops,
            anomaly_score: anomaly_score(pair.similarity, hops, config.max_hops),
        });
    }

    // Stable: equal scores keep neighbor order
    anomalies.sort_by(|a, b| b.anomaly_score.total_cmp(&a.anomaly_score));

    info!(
        "Scored {} pairs ({} already linked within {} hops, {} unresolvable)",
        anomalies.len(),
        too_close,
        config.hops_threshold,
        skipped
    );

    anomalies
}

/// Directed links inside each cluster against all possible member pairs
pub fn cluster_coherence(clusters: &[Cluster], graph: &LinkGraph) -> Vec<ClusterCoherence> {
    clusters
        .iter()
        .map(|cluster| {
            let size = cluster.urls.len();
            let members: HashSet<&str> = cluster.urls.iter().map(String::as_str).collect();

            let (mut internal_links, mut external_links) = (0, 0);
            if size >= 2 {
                for url in &cluster.urls {
                    for target in graph.targets(url).into_iter().flatten() {
                        if members.contains(target.as_str()) {
                            internal_links += 1;
                        } else {
                            external_links += 1;
                        }
                    }
                }
            }

            let possible = size * size.saturating_sub(1);
            let coherence_score = if possible > 0 {
                internal_links as f32 / possible as f32
            } else {
                0.0
            };

            ClusterCoherence {
                cluster_id: cluster.cluster_id,
                size,
                internal_links,
                external_links,
                coherence_score,
            }
        })
        .collect()
}

pub fn summarize(
    total_pages: usize,
    semantic_pairs: usize,
    anomalies: &[ProximityAnomaly],
    coherence: &[ClusterCoherence],
) -> AnalysisSummary {
    AnalysisSummary {
        total_pages,
        semantic_pairs,
        proximity_anomalies: anomalies.len(),
        avg_anomaly_score: mean(anomalies.iter().map(|a| a.anomaly_score)),
        clusters_with_links: coherence.iter().filter(|c| c.internal_links > 0).count(),
        avg_cluster_coherence: mean(coherence.iter().map(|c| c.coherence_score)),
    }
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let (sum, count) = values.fold((0.0f32, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        sum / count as f32
    }
}
