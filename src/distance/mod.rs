//! Similarity kernels for late-interaction scoring
//!
//! All scoring in the engine runs on inner products: centroids and query
//! rows are L2-normalized, so inner product equals cosine similarity.

/// Inner product of two equal-length vectors
#[inline]
pub fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// L2 norm
#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// MaxSim over row-major token matrices
///
/// For each query row, take the maximum inner product across all document
/// rows, and sum the maxima. This is the exact late-interaction score.
pub fn maxsim(query: &[f32], doc: &[f32], dim: usize) -> f32 {
    debug_assert!(dim > 0);
    let mut total = 0.0f32;
    for q in query.chunks_exact(dim) {
        let mut best = f32::NEG_INFINITY;
        for t in doc.chunks_exact(dim) {
            let s = inner_product(q, t);
            if s > best {
                best = s;
            }
        }
        if best > f32::NEG_INFINITY {
            total += best;
        }
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_product() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((inner_product(&a, &b) - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_maxsim_picks_best_token() {
        // one query row, two doc rows; the second doc row matches better
        let query = vec![1.0, 0.0];
        let doc = vec![0.0, 1.0, 1.0, 0.0];
        assert!((maxsim(&query, &doc, 2) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_maxsim_sums_query_rows() {
        let query = vec![1.0, 0.0, 0.0, 1.0];
        let doc = vec![1.0, 0.0, 0.0, 1.0];
        assert!((maxsim(&query, &doc, 2) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_maxsim_empty_doc() {
        let query = vec![1.0, 0.0];
        assert_eq!(maxsim(&query, &[], 2), 0.0);
    }
}
