//! k-means with k-means++ seeding
//!
//! Shared by the coarse quantizer (spherical, inner-product lookup) and
//! the product quantizer (plain L2). Training is deterministic: the RNG
//! is seeded from the caller's config and accumulation is sequential,
//! so the same sample and parameters always produce the same table.

use crate::{LateError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

#[derive(Debug, Clone, Copy)]
pub struct KmeansParams {
    /// Number of clusters
    pub k: usize,
    /// Lloyd iterations after seeding
    pub iterations: usize,
    /// RNG seed for k-means++ initialization
    pub seed: u64,
    /// L2-normalize centroids after every update (inner product becomes
    /// cosine similarity)
    pub spherical: bool,
}

/// Train `k` centroids over row-major `data` of width `dim`.
///
/// Returns a `k * dim` row-major table. Fewer distinct points than `k`
/// is tolerated: surplus centroids stay where seeding put them.
pub fn train(data: &[f32], dim: usize, params: &KmeansParams) -> Result<Vec<f32>> {
    if dim == 0 || data.is_empty() {
        return Err(LateError::InvalidTraining("empty training sample".into()));
    }
    debug_assert_eq!(data.len() % dim, 0);
    let n = data.len() / dim;
    if n < params.k {
        return Err(LateError::InvalidTraining(format!(
            "{} training points for {} clusters",
            n, params.k
        )));
    }

    let mut centroids = seed_plus_plus(data, dim, n, params);

    let mut assignment = vec![0usize; n];
    for _ in 0..params.iterations {
        // assignment is pure per point, safe to parallelize
        assignment
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, slot)| {
                *slot = nearest(&centroids, params.k, dim, &data[i * dim..(i + 1) * dim]).0;
            });

        // sequential accumulation keeps the update deterministic
        let mut sums = vec![0.0f64; params.k * dim];
        let mut counts = vec![0usize; params.k];
        for (i, &c) in assignment.iter().enumerate() {
            counts[c] += 1;
            let row = &data[i * dim..(i + 1) * dim];
            let acc = &mut sums[c * dim..(c + 1) * dim];
            for (a, &x) in acc.iter_mut().zip(row) {
                *a += x as f64;
            }
        }

        for c in 0..params.k {
            if counts[c] == 0 {
                // empty cluster keeps its previous centroid
                continue;
            }
            let inv = 1.0 / counts[c] as f64;
            let dst = &mut centroids[c * dim..(c + 1) * dim];
            let src = &sums[c * dim..(c + 1) * dim];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d = (s * inv) as f32;
            }
            if params.spherical {
                normalize(&mut centroids[c * dim..(c + 1) * dim]);
            }
        }
    }

    if params.spherical {
        for c in 0..params.k {
            normalize(&mut centroids[c * dim..(c + 1) * dim]);
        }
    }

    Ok(centroids)
}

/// Index and squared L2 distance of the nearest centroid
pub fn nearest(centroids: &[f32], k: usize, dim: usize, point: &[f32]) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for c in 0..k {
        let row = &centroids[c * dim..(c + 1) * dim];
        let dist: f32 = row
            .iter()
            .zip(point)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if dist < best_dist {
            best_dist = dist;
            best = c;
        }
    }
    (best, best_dist)
}

fn seed_plus_plus(data: &[f32], dim: usize, n: usize, params: &KmeansParams) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = Vec::with_capacity(params.k * dim);

    // the first center is pinned to the first sample point; subsequent
    // centers are sampled by squared distance with the seeded RNG
    centroids.extend_from_slice(&data[..dim]);

    let mut dists = vec![0.0f32; n];
    for chosen in 1..params.k {
        dists
            .par_iter_mut()
            .enumerate()
            .for_each(|(i, slot)| {
                *slot = nearest(&centroids, chosen, dim, &data[i * dim..(i + 1) * dim]).1;
            });

        let total: f64 = dists.iter().map(|&d| d as f64).sum();
        let pick = if total > 0.0 {
            // sample proportionally to squared distance
            let target = rng.gen::<f64>() * total;
            let mut acc = 0.0f64;
            let mut pick = n - 1;
            for (i, &d) in dists.iter().enumerate() {
                acc += d as f64;
                if acc >= target {
                    pick = i;
                    break;
                }
            }
            pick
        } else {
            // every remaining point coincides with a centroid
            rng.gen_range(0..n)
        };
        centroids.extend_from_slice(&data[pick * dim..(pick + 1) * dim]);
    }

    centroids
}

fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}
