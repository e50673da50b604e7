// pipeline/index.rs
// Phase 2: Vector neighbor index - cosine top-k search over page embeddings

use crate::error::IndexError;
use crate::pipeline::embed::EmbeddingSet;
use crate::pipeline::ingest::NodeId;
use hnsw_rs::prelude::*;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Instant;
use tracing::{debug, info};

/// Vectors whose L2 norm is further than this from 1.0 get re-normalized
pub const NORM_TOLERANCE: f32 = 1e-5;

/// Query rows per exact-search work unit
const QUERY_BLOCK: usize = 256;

/// Configuration for neighbor search
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Neighbors retrieved per page
    pub k: usize,

    /// Pairs below this cosine similarity are not reported
    pub similarity_threshold: f32,

    /// Above this many vectors the index switches to HNSW
    pub exact_limit: usize,

    /// HNSW graph degree
    pub hnsw_m: usize,

    pub hnsw_ef_construction: usize,

    pub hnsw_ef_search: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            k: 20,
            similarity_threshold: 0.80,
            exact_limit: 20_000,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 64,
        }
    }
}

/// A retrieved neighbor: row in the index and its cosine similarity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub row: usize,
    pub similarity: f32,
}

/// `node_j` is the `rank`-th neighbor of query `node_i` (1-based, self excluded)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborPair {
    pub node_i: NodeId,
    pub node_j: NodeId,
    pub similarity: f32,
    pub rank: usize,
}

/// Scale `vector` to unit length unless it already is (or is all zeros)
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 && (norm - 1.0).abs() > NORM_TOLERANCE {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Row-wise `normalize`
pub fn normalize_rows(vectors: &mut Array2<f32>) {
    for mut row in vectors.rows_mut() {
        if let Some(slice) = row.as_slice_mut() {
            normalize(slice);
        } else {
            let mut owned = row.to_vec();
            normalize(&mut owned);
            row.assign(&ArrayView1::from(&owned));
        }
    }
}

/// Inner-product search over unit vectors.
///
/// Exact search is a blocked matrix product; past `exact_limit` rows the
/// index is an HNSW graph with cosine distance.
pub enum NeighborIndex {
    Exact(Array2<f32>),
    Hnsw(HnswIndex),
}

pub struct HnswIndex {
    inner: Hnsw<'static, f32, DistCosine>,
    len: usize,
    dimensions: usize,
    ef_search: usize,
}

impl NeighborIndex {
    /// Build an index over already-normalized vectors
    pub fn build(vectors: &Array2<f32>, config: &IndexConfig) -> Self {
        let n = vectors.nrows();
        if n <= config.exact_limit {
            debug!("Exact index over {} vectors", n);
            return NeighborIndex::Exact(vectors.clone());
        }

        info!(
            "Approximate index over {} vectors (M={}, ef_construction={})",
            n, config.hnsw_m, config.hnsw_ef_construction
        );
        let max_layer = 16.min((n as f32).ln().ceil().max(1.0) as usize);
        let inner = Hnsw::<f32, DistCosine>::new(
            config.hnsw_m,
            n,
            max_layer,
            config.hnsw_ef_construction,
            DistCosine {},
        );
        let mut index = HnswIndex {
            inner,
            len: 0,
            dimensions: vectors.ncols(),
            ef_search: config.hnsw_ef_search,
        };
        index.insert(vectors.view());
        NeighborIndex::Hnsw(index)
    }

    pub fn len(&self) -> usize {
        match self {
            NeighborIndex::Exact(vectors) => vectors.nrows(),
            NeighborIndex::Hnsw(index) => index.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Vector width, `None` while an exact index is still empty
    pub fn dimensions(&self) -> Option<usize> {
        match self {
            NeighborIndex::Exact(vectors) if vectors.nrows() == 0 => None,
            NeighborIndex::Exact(vectors) => Some(vectors.ncols()),
            NeighborIndex::Hnsw(index) => Some(index.dimensions),
        }
    }

    /// Append normalized vectors; new rows are numbered after existing ones.
    ///
    /// Rows of a different width are rejected as a whole and the index is
    /// left unchanged.
    pub fn add(&mut self, vectors: ArrayView2<f32>) -> Result<(), IndexError> {
        if let Some(expected) = self.dimensions() {
            if vectors.ncols() != expected {
                return Err(IndexError::DimensionMismatch {
                    expected,
                    got: vectors.ncols(),
                });
            }
        }

        match self {
            NeighborIndex::Exact(existing) if existing.nrows() == 0 => {
                *existing = vectors.to_owned();
            }
            NeighborIndex::Exact(existing) => {
                let expected = existing.ncols();
                existing
                    .append(Axis(0), vectors)
                    .map_err(|_| IndexError::DimensionMismatch {
                        expected,
                        got: vectors.ncols(),
                    })?;
            }
            NeighborIndex::Hnsw(index) => index.insert(vectors),
        }
        debug!("Index now holds {} vectors", self.len());
        Ok(())
    }

    /// Top-`k` neighbors of each query row, most similar first
    pub fn search(&self, queries: ArrayView2<f32>, k: usize) -> Vec<Vec<Neighbor>> {
        let k = k.min(self.len());
        if k == 0 {
            return vec![Vec::new(); queries.nrows()];
        }

        match self {
            NeighborIndex::Exact(vectors) => exact_search(vectors.view(), queries, k),
            NeighborIndex::Hnsw(index) => index.search(queries, k),
        }
    }

    /// Neighbors of every indexed row among the others: searches `k + 1` and
    /// drops the row itself.
    pub fn self_neighbors(&self, vectors: ArrayView2<f32>, k: usize) -> Vec<Vec<Neighbor>> {
        let k = k.min(self.len().saturating_sub(1));
        if k == 0 {
            return vec![Vec::new(); vectors.nrows()];
        }

        self.search(vectors, k + 1)
            .into_iter()
            .enumerate()
            .map(|(i, hits)| hits.into_iter().filter(|n| n.row != i).take(k).collect())
            .collect()
    }
}

impl HnswIndex {
    fn insert(&mut self, vectors: ArrayView2<f32>) {
        for row in vectors.rows() {
            let data = row.to_vec();
            self.inner.insert_slice((&data, self.len));
            self.len += 1;
        }
    }

    fn search(&self, queries: ArrayView2<f32>, k: usize) -> Vec<Vec<Neighbor>> {
        let ef = self.ef_search.max(k);
        let rows: Vec<Vec<f32>> = queries.rows().into_iter().map(|r| r.to_vec()).collect();
        rows.par_iter()
            .map(|query| {
                let mut hits: Vec<Neighbor> = self
                    .inner
                    .search(query, k, ef)
                    .into_iter()
                    .map(|n| Neighbor {
                        row: n.d_id,
                        similarity: 1.0 - n.distance,
                    })
                    .collect();
                hits.sort_by(by_similarity);
                hits
            })
            .collect()
    }
}

fn by_similarity(a: &Neighbor, b: &Neighbor) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.row.cmp(&b.row))
}

fn exact_search(vectors: ArrayView2<f32>, queries: ArrayView2<f32>, k: usize) -> Vec<Vec<Neighbor>> {
    let starts: Vec<usize> = (0..queries.nrows()).step_by(QUERY_BLOCK).collect();

    let blocks: Vec<Vec<Vec<Neighbor>>> = starts
        .into_par_iter()
        .map(|start| {
            let end = (start + QUERY_BLOCK).min(queries.nrows());
            let block = queries.slice_axis(Axis(0), (start..end).into());
            let sims = block.dot(&vectors.t());

            sims.rows()
                .into_iter()
                .map(|row| {
                    let mut hits: Vec<Neighbor> = row
                        .iter()
                        .enumerate()
                        .map(|(row, &similarity)| Neighbor { row, similarity })
                        .collect();
                    if k < hits.len() {
                        hits.select_nth_unstable_by(k - 1, by_similarity);
                        hits.truncate(k);
                    }
                    hits.sort_by(by_similarity);
                    hits
                })
                .collect()
        })
        .collect();

    blocks.into_iter().flatten().collect()
}

/// Top-k semantic neighbors of every page, kept when similarity clears the
/// threshold. The result is directional: `(i, j)` may appear without `(j, i)`.
pub fn find_semantic_neighbors(embeddings: &EmbeddingSet, config: &IndexConfig) -> Vec<NeighborPair> {
    let n = embeddings.len();
    if n < 2 {
        return Vec::new();
    }

    let start = Instant::now();
    let mut vectors = embeddings.vectors.clone();
    normalize_rows(&mut vectors);

    let index = NeighborIndex::build(&vectors, config);
    let neighbors = index.self_neighbors(vectors.view(), config.k);

    let pairs: Vec<NeighborPair> = neighbors
        .into_iter()
        .enumerate()
        .flat_map(|(i, hits)| {
            hits.into_iter()
                .enumerate()
                .filter(|(_, hit)| hit.similarity >= config.similarity_threshold)
                .map(move |(pos, hit)| (i, pos + 1, hit))
        })
        .map(|(i, rank, hit)| NeighborPair {
            node_i: embeddings.node_ids[i].clone(),
            node_j: embeddings.node_ids[hit.row].clone(),
            similarity: hit.similarity,
            rank,
        })
        .collect();

    info!(
        "Found {} neighbor pairs >= {:.2} among {} pages in {:.2}s",
        pairs.len(),
        config.similarity_threshold,
        n,
        start.elapsed().as_secs_f32()
    );

    pairs
}
