// pipeline/reduce.rs
// Dimensionality reduction - fuzzy neighbor graph layout and linear projection

use crate::error::AlgorithmError;
use crate::pipeline::index::Neighbor;
use ndarray::{Array1, Array2, Axis};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::debug;

pub type ReduceResult<T> = std::result::Result<T, AlgorithmError>;

/// Gradient clamp for layout updates
const CLIP: f32 = 4.0;

/// Initial layouts are scaled into [-INIT_SCALE, INIT_SCALE]
const INIT_SCALE: f32 = 10.0;

/// Configuration for manifold reduction
#[derive(Debug, Clone)]
pub struct ManifoldConfig {
    /// Output dimensionality
    pub n_components: usize,

    /// Neighborhood size of the fuzzy graph
    pub n_neighbors: usize,

    /// Minimum spacing of embedded points
    pub min_dist: f32,

    pub spread: f32,

    /// Optimization epochs; `None` picks by dataset size
    pub n_epochs: Option<usize>,

    pub learning_rate: f32,

    /// Negative samples per positive edge sample
    pub negative_sample_rate: usize,

    pub seed: u64,
}

impl Default for ManifoldConfig {
    fn default() -> Self {
        Self {
            n_components: 2,
            n_neighbors: 15,
            min_dist: 0.1,
            spread: 1.0,
            n_epochs: None,
            learning_rate: 1.0,
            negative_sample_rate: 5,
            seed: 42,
        }
    }
}

impl ManifoldConfig {
    pub fn epochs_for(&self, n: usize) -> usize {
        self.n_epochs
            .unwrap_or(if n <= 10_000 { 500 } else { 200 })
    }
}

/// Embed `vectors` into `config.n_components` dimensions.
///
/// `knn` holds each row's cosine neighbors (self excluded), most similar
/// first, as produced by the neighbor index.
pub fn manifold_reduce(
    vectors: &Array2<f32>,
    knn: &[Vec<Neighbor>],
    config: &ManifoldConfig,
) -> ReduceResult<Array2<f32>> {
    let n = vectors.nrows();
    if n < 3 {
        return Err(AlgorithmError::TooFewPoints { needed: 3, got: n });
    }
    if knn.len() != n {
        return Err(AlgorithmError::Reduction(format!(
            "{} neighbor lists for {} points",
            knn.len(),
            n
        )));
    }
    if config.n_components == 0 {
        return Err(AlgorithmError::Reduction("zero output dimensions".to_string()));
    }

    let n_epochs = config.epochs_for(n);
    let mut edges = fuzzy_graph(knn, config.n_neighbors.max(2));
    let max_weight = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);
    // Edges too weak to be sampled even once are dropped
    edges.retain(|e| e.2 >= max_weight / n_epochs as f32);
    if edges.is_empty() {
        return Err(AlgorithmError::Reduction("empty neighbor graph".to_string()));
    }

    let (a, b) = fit_curve(config.spread, config.min_dist);
    debug!(
        "Manifold reduction: {} points -> {} dims, {} edges, {} epochs (a={:.3}, b={:.3})",
        n,
        config.n_components,
        edges.len(),
        n_epochs,
        a,
        b
    );

    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut layout = initial_layout(vectors, config.n_components, config.seed, &mut rng);
    optimize_layout(&mut layout, &edges, n_epochs, a, b, config, &mut rng);

    if layout.iter().any(|v| !v.is_finite()) {
        return Err(AlgorithmError::NonFinite("manifold reduction"));
    }

    Ok(layout)
}

/// Principal-component projection of `vectors` into `n_components` dims.
///
/// Components beyond `min(n, d)` are zero-filled, so any N >= 1 yields a
/// result of the requested width.
pub fn linear_project(
    vectors: &Array2<f32>,
    n_components: usize,
    seed: u64,
) -> ReduceResult<Array2<f32>> {
    let (n, d) = vectors.dim();
    if n == 0 {
        return Err(AlgorithmError::TooFewPoints { needed: 1, got: 0 });
    }
    if vectors.iter().any(|v| !v.is_finite()) {
        return Err(AlgorithmError::Linear("non-finite input".to_string()));
    }

    let mean = vectors
        .mean_axis(Axis(0))
        .ok_or_else(|| AlgorithmError::Linear("empty input".to_string()))?;
    let mut residual = vectors - &mean;

    let fitted = n_components.min(d).min(n);
    let mut projected = Array2::<f32>::zeros((n, n_components));
    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    for c in 0..fitted {
        let component = top_component(&residual, &mut rng, 100, 1e-6);
        let scores = residual.dot(&component);

        // Deflate: remove this component before searching the next
        for (mut row, &score) in residual.rows_mut().into_iter().zip(scores.iter()) {
            row.scaled_add(-score, &component);
        }
        projected.column_mut(c).assign(&scores);
    }

    if projected.iter().any(|v| !v.is_finite()) {
        return Err(AlgorithmError::NonFinite("linear projection"));
    }

    Ok(projected)
}

/// Power iteration for the dominant direction of `data`
fn top_component(
    data: &Array2<f32>,
    rng: &mut ChaCha8Rng,
    max_iter: usize,
    tolerance: f32,
) -> Array1<f32> {
    let d = data.ncols();
    let mut v: Array1<f32> = (0..d).map(|_| rng.gen::<f32>() - 0.5).collect();
    let norm = v.dot(&v).sqrt();
    if norm > 0.0 {
        v /= norm;
    }

    for _ in 0..max_iter {
        // X^T (X v) without materializing the covariance
        let u = data.dot(&v);
        let mut next = data.t().dot(&u);
        let norm = next.dot(&next).sqrt();
        if norm < 1e-10 {
            break;
        }
        next /= norm;

        let diff: f32 = v.iter().zip(next.iter()).map(|(a, b)| (a - b).abs()).sum();
        v = next;
        if diff < tolerance {
            break;
        }
    }

    // Fix the sign so the largest coordinate is positive
    let pivot = v
        .iter()
        .copied()
        .fold(0.0f32, |acc, x| if x.abs() > acc.abs() { x } else { acc });
    if pivot < 0.0 {
        v.mapv_inplace(|x| -x);
    }

    v
}

/// Symmetric fuzzy membership graph as directed `(head, tail, weight)` edges,
/// both directions present, in deterministic order.
fn fuzzy_graph(knn: &[Vec<Neighbor>], n_neighbors: usize) -> Vec<(usize, usize, f32)> {
    let target = (n_neighbors as f32).log2();

    let memberships: Vec<Vec<(usize, f32)>> = knn
        .par_iter()
        .map(|hits| {
            let hits = &hits[..hits.len().min(n_neighbors)];
            let dists: Vec<f32> = hits.iter().map(|h| (1.0 - h.similarity).max(0.0)).collect();
            let rho = dists.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);
            let sigma = smooth_sigma(&dists, rho, target);

            hits.iter()
                .zip(dists.iter())
                .map(|(h, &dist)| (h.row, (-(dist - rho).max(0.0) / sigma).exp()))
                .collect()
        })
        .collect();

    let mut directed: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for (i, row) in memberships.iter().enumerate() {
        for &(j, w) in row {
            if i != j {
                directed.insert((i, j), w);
            }
        }
    }

    let mut edges = Vec::with_capacity(directed.len() * 2);
    for (&(i, j), &w) in &directed {
        let back = directed.get(&(j, i)).copied();
        if back.is_some() && j < i {
            continue;
        }
        let back = back.unwrap_or(0.0);
        // Fuzzy union: a + b - ab
        let weight = w + back - w * back;
        edges.push((i, j, weight));
        edges.push((j, i, weight));
    }

    edges
}

/// Binary search for the kernel width that gives `target` total membership
fn smooth_sigma(dists: &[f32], rho: f32, target: f32) -> f32 {
    let (mut lo, mut hi, mut mid) = (0.0f32, f32::INFINITY, 1.0f32);

    for _ in 0..64 {
        let psum: f32 = dists
            .iter()
            .map(|&d| (-(d - rho).max(0.0) / mid).exp())
            .sum();

        if (psum - target).abs() < 1e-5 {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi.is_infinite() { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let mean = if dists.is_empty() {
        0.0
    } else {
        dists.iter().sum::<f32>() / dists.len() as f32
    };
    mid.max(1e-3 * mean).max(1e-6)
}

/// Fit `1 / (1 + a x^(2b))` to the target membership curve for
/// (`spread`, `min_dist`) by coarse-then-fine grid search.
pub fn fit_curve(spread: f32, min_dist: f32) -> (f32, f32) {
    let xs: Vec<f32> = (0..300).map(|i| i as f32 * 3.0 * spread / 299.0).collect();
    let ys: Vec<f32> = xs
        .iter()
        .map(|&x| {
            if x < min_dist {
                1.0
            } else {
                (-(x - min_dist) / spread).exp()
            }
        })
        .collect();

    let error = |a: f32, b: f32| -> f32 {
        xs.iter()
            .zip(ys.iter())
            .map(|(&x, &y)| {
                let fit = 1.0 / (1.0 + a * x.powf(2.0 * b));
                (fit - y) * (fit - y)
            })
            .sum()
    };

    let search = |a_range: (f32, f32), b_range: (f32, f32), steps: usize| {
        let mut best = (1.0f32, 1.0f32, f32::INFINITY);
        for ia in 0..=steps {
            let a = a_range.0 + (a_range.1 - a_range.0) * ia as f32 / steps as f32;
            for ib in 0..=steps {
                let b = b_range.0 + (b_range.1 - b_range.0) * ib as f32 / steps as f32;
                if a <= 0.0 || b <= 0.0 {
                    continue;
                }
                let e = error(a, b);
                if e < best.2 {
                    best = (a, b, e);
                }
            }
        }
        best
    };

    let (a0, b0, _) = search((0.05, 5.0), (0.2, 2.0), 60);
    let (a, b, _) = search((a0 - 0.1, a0 + 0.1), (b0 - 0.04, b0 + 0.04), 40);

    (a, b)
}

fn initial_layout(
    vectors: &Array2<f32>,
    n_components: usize,
    seed: u64,
    rng: &mut ChaCha8Rng,
) -> Array2<f32> {
    let n = vectors.nrows();

    let mut layout = match linear_project(vectors, n_components, seed) {
        Ok(projected) => {
            let max_abs = projected.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            if max_abs > 1e-12 {
                projected * (INIT_SCALE / max_abs)
            } else {
                random_layout(n, n_components, rng)
            }
        }
        Err(e) => {
            debug!("Linear initialization unavailable ({}), using random layout", e);
            random_layout(n, n_components, rng)
        }
    };

    // Jitter separates duplicate points
    layout.mapv_inplace(|v| v + (rng.gen::<f32>() - 0.5) * 1e-4 * INIT_SCALE);
    layout
}

fn random_layout(n: usize, n_components: usize, rng: &mut ChaCha8Rng) -> Array2<f32> {
    Array2::from_shape_fn((n, n_components), |_| {
        rng.gen_range(-INIT_SCALE..INIT_SCALE)
    })
}

/// Seeded stochastic gradient descent over the edge list
fn optimize_layout(
    layout: &mut Array2<f32>,
    edges: &[(usize, usize, f32)],
    n_epochs: usize,
    a: f32,
    b: f32,
    config: &ManifoldConfig,
    rng: &mut ChaCha8Rng,
) {
    let n = layout.nrows();
    let dim = layout.ncols();
    let max_weight = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);
    let negative_rate = config.negative_sample_rate.max(1) as f32;

    let epochs_per_sample: Vec<f32> = edges.iter().map(|e| max_weight / e.2).collect();
    let epochs_per_negative: Vec<f32> = epochs_per_sample.iter().map(|e| e / negative_rate).collect();
    let mut next_sample = epochs_per_sample.clone();
    let mut next_negative = epochs_per_negative.clone();

    let mut current = vec![0.0f32; dim];
    let mut other = vec![0.0f32; dim];

    for epoch in 0..n_epochs {
        let alpha = config.learning_rate * (1.0 - epoch as f32 / n_epochs as f32);
        let epoch_f = epoch as f32;

        for (e, &(head, tail, _)) in edges.iter().enumerate() {
            if next_sample[e] > epoch_f {
                continue;
            }

            // Attraction along the edge
            load(layout, head, &mut current);
            load(layout, tail, &mut other);
            let d2 = squared_distance(&current, &other);
            if d2 > 0.0 {
                let coeff = -2.0 * a * b * d2.powf(b - 1.0) / (1.0 + a * d2.powf(b));
                for k in 0..dim {
                    let grad = (coeff * (current[k] - other[k])).clamp(-CLIP, CLIP);
                    layout[[head, k]] += grad * alpha;
                    layout[[tail, k]] -= grad * alpha;
                }
            }
            next_sample[e] += epochs_per_sample[e];

            // Repulsion from random points
            let n_negative = ((epoch_f - next_negative[e]) / epochs_per_negative[e]).max(0.0) as usize;
            for _ in 0..n_negative {
                let sample = rng.gen_range(0..n);
                if sample == head {
                    continue;
                }
                load(layout, head, &mut current);
                load(layout, sample, &mut other);
                let d2 = squared_distance(&current, &other);
                let coeff = if d2 > 0.0 {
                    2.0 * b / ((0.001 + d2) * (1.0 + a * d2.powf(b)))
                } else {
                    0.0
                };
                for k in 0..dim {
                    let grad = if coeff > 0.0 {
                        (coeff * (current[k] - other[k])).clamp(-CLIP, CLIP)
                    } else {
                        CLIP
                    };
                    layout[[head, k]] += grad * alpha;
                }
            }
            next_negative[e] += n_negative as f32 * epochs_per_negative[e];
        }
    }
}

fn load(layout: &Array2<f32>, row: usize, into: &mut [f32]) {
    for (slot, value) in into.iter_mut().zip(layout.row(row).iter()) {
        *slot = *value;
    }
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}
