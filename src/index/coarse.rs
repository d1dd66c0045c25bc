//! Coarse quantizer: the IVF centroid codebook
//!
//! Trained once with spherical k-means; centroids are L2-normalized so
//! inner product equals cosine similarity. Lookup answers "top-n
//! nearest centroids and their scores" for single vectors and whole
//! query tensors.

use crate::distance::inner_product;
use crate::quantizer::kmeans::{self, KmeansParams};
use crate::schema::{put_f32_slice, Reader};
use crate::types::{CentroidId, Tensor};
use crate::{LateError, Result};
use rayon::prelude::*;

#[derive(Debug, Clone, PartialEq)]
pub struct CoarseQuantizer {
    k: usize,
    dim: usize,
    /// Row-major `k * dim`, L2-normalized rows
    centroids: Vec<f32>,
}

impl CoarseQuantizer {
    /// Train `k` centroids on row-major sample vectors
    pub fn train(sample: &[f32], dim: usize, k: usize, iterations: usize, seed: u64) -> Result<Self> {
        let centroids = kmeans::train(
            sample,
            dim,
            &KmeansParams {
                k,
                iterations,
                seed,
                spherical: true,
            },
        )?;
        tracing::debug!(k, dim, iterations, "trained coarse quantizer");
        Ok(Self { k, dim, centroids })
    }

    /// Adopt an externally trained codebook. Rows are re-normalized so
    /// lookup stays an inner product.
    pub fn from_centroids(mut centroids: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 || centroids.is_empty() || centroids.len() % dim != 0 {
            return Err(LateError::InvalidTraining(
                "centroid table shape mismatch".into(),
            ));
        }
        for row in centroids.chunks_exact_mut(dim) {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in row.iter_mut() {
                    *x /= norm;
                }
            }
        }
        let k = centroids.len() / dim;
        Ok(Self { k, dim, centroids })
    }

    pub fn num_centroids(&self) -> usize {
        self.k
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn centroid(&self, id: CentroidId) -> &[f32] {
        let i = id as usize;
        &self.centroids[i * self.dim..(i + 1) * self.dim]
    }

    /// Inner-product scores of one vector against all centroids
    pub fn scores(&self, v: &[f32]) -> Result<Vec<f32>> {
        if v.len() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: v.len(),
            });
        }
        Ok(self
            .centroids
            .chunks_exact(self.dim)
            .map(|c| inner_product(c, v))
            .collect())
    }

    /// Scores of a whole query tensor: row-major `Tq x K`
    pub fn score_tensor(&self, query: &Tensor) -> Result<Vec<f32>> {
        if query.dim() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: query.dim(),
            });
        }
        let tq = query.num_tokens();
        let mut out = vec![0.0f32; tq * self.k];
        out.par_chunks_mut(self.k)
            .enumerate()
            .for_each(|(row, slot)| {
                let q = query.row(row);
                for (c, centroid) in self.centroids.chunks_exact(self.dim).enumerate() {
                    slot[c] = inner_product(centroid, q);
                }
            });
        Ok(out)
    }

    /// Nearest centroid by inner product, ties to the lowest id
    pub fn assign(&self, v: &[f32]) -> Result<CentroidId> {
        if v.len() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: v.len(),
            });
        }
        let mut best = 0usize;
        let mut best_score = f32::NEG_INFINITY;
        for (c, centroid) in self.centroids.chunks_exact(self.dim).enumerate() {
            let s = inner_product(centroid, v);
            if s > best_score {
                best_score = s;
                best = c;
            }
        }
        Ok(best as CentroidId)
    }

    /// Top `n` centroid ids for one score row, highest score first,
    /// ties by ascending id. `n >= K` returns all centroids.
    pub fn top_n(scores: &[f32], n: usize) -> Vec<(CentroidId, f32)> {
        let mut ids: Vec<u32> = (0..scores.len() as u32).collect();
        let by_score = |&a: &u32, &b: &u32| {
            scores[b as usize]
                .total_cmp(&scores[a as usize])
                .then(a.cmp(&b))
        };
        let n = n.min(ids.len());
        if n < ids.len() {
            ids.select_nth_unstable_by(n, by_score);
            ids.truncate(n);
        }
        ids.sort_by(by_score);
        ids.into_iter()
            .map(|id| (id, scores[id as usize]))
            .collect()
    }

    /// Wire format: `K u32 | D u32 | data f32[K*D]`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 4 * self.centroids.len());
        buf.extend_from_slice(&(self.k as u32).to_be_bytes());
        buf.extend_from_slice(&(self.dim as u32).to_be_bytes());
        put_f32_slice(&mut buf, &self.centroids);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let k = r.u32()? as usize;
        let dim = r.u32()? as usize;
        if k == 0 || dim == 0 {
            return Err(LateError::Corruption("bad centroid table header".into()));
        }
        let centroids = r.f32_vec(k * dim)?;
        Ok(Self { k, dim, centroids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quantizer() -> CoarseQuantizer {
        // axis-aligned unit vectors, already normalized
        CoarseQuantizer::from_centroids(
            vec![
                1.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, //
                0.0, 0.0, 1.0,
            ],
            3,
        )
        .unwrap()
    }

    #[test]
    fn test_assign_picks_nearest() {
        let q = quantizer();
        assert_eq!(q.assign(&[0.9, 0.1, 0.0]).unwrap(), 0);
        assert_eq!(q.assign(&[0.0, 0.2, 0.9]).unwrap(), 2);
    }

    #[test]
    fn test_assign_tie_breaks_low_id() {
        let q = quantizer();
        // equidistant from centroids 0 and 1
        assert_eq!(q.assign(&[0.5, 0.5, 0.0]).unwrap(), 0);
    }

    #[test]
    fn test_top_n_order_and_clamp() {
        let scores = vec![0.1, 0.9, 0.5];
        let top = CoarseQuantizer::top_n(&scores, 2);
        assert_eq!(top[0].0, 1);
        assert_eq!(top[1].0, 2);

        // n beyond K returns everything
        let all = CoarseQuantizer::top_n(&scores, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[2].0, 0);
    }

    #[test]
    fn test_top_n_tie_breaks_ascending_id() {
        let scores = vec![0.5, 0.5, 0.5];
        let top = CoarseQuantizer::top_n(&scores, 2);
        assert_eq!(top.iter().map(|t| t.0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_score_tensor_shape() {
        let q = quantizer();
        let t = Tensor::from_rows(&[vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]).unwrap();
        let scores = q.score_tensor(&t).unwrap();
        assert_eq!(scores.len(), 6);
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!((scores[3 + 1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dimension_mismatch() {
        let q = quantizer();
        assert!(matches!(
            q.scores(&[1.0, 0.0]),
            Err(LateError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_train_is_deterministic_and_normalized() {
        let sample: Vec<f32> = (0..900).map(|i| ((i % 31) as f32) * 0.1 + 1.0).collect();
        let a = CoarseQuantizer::train(&sample, 3, 4, 5, 11).unwrap();
        let b = CoarseQuantizer::train(&sample, 3, 4, 5, 11).unwrap();
        assert_eq!(a, b);
        for c in 0..4 {
            let norm: f32 = a
                .centroid(c)
                .iter()
                .map(|x| x * x)
                .sum::<f32>()
                .sqrt();
            assert!((norm - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_serialization_roundtrip() {
        let q = quantizer();
        let back = CoarseQuantizer::from_bytes(&q.to_bytes()).unwrap();
        assert_eq!(q, back);
    }
}
