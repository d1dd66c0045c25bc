//! Tensor data type: a contiguous T x D matrix of per-token embeddings

use crate::{LateError, Result};
use serde::{Deserialize, Serialize};

/// Per-token embedding matrix, row-major Float32
///
/// One row per token, `dim` values per row. A single-vector embedding is
/// simply a tensor with one row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tensor {
    /// Number of tokens (rows)
    num_tokens: usize,

    /// Embedding dimension (columns)
    dim: usize,

    /// Row-major data, length num_tokens * dim
    data: Vec<f32>,
}

impl Tensor {
    /// Create a tensor from row-major data
    pub fn new(data: Vec<f32>, dim: usize) -> Result<Self> {
        if dim == 0 {
            return Err(LateError::InvalidArgument("tensor dim must be > 0".into()));
        }
        if data.len() % dim != 0 {
            return Err(LateError::DimensionMismatch {
                expected: dim,
                got: data.len(),
            });
        }
        let num_tokens = data.len() / dim;
        Ok(Self {
            num_tokens,
            dim,
            data,
        })
    }

    /// Build a tensor from a list of equal-length rows
    pub fn from_rows(rows: &[Vec<f32>]) -> Result<Self> {
        let dim = rows.first().map(|r| r.len()).unwrap_or(0);
        let mut data = Vec::with_capacity(rows.len() * dim);
        for row in rows {
            if row.len() != dim {
                return Err(LateError::DimensionMismatch {
                    expected: dim,
                    got: row.len(),
                });
            }
            data.extend_from_slice(row);
        }
        Tensor::new(data, dim.max(1))
    }

    /// Number of token rows
    pub fn num_tokens(&self) -> usize {
        self.num_tokens
    }

    /// Embedding dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Row `i` as a slice (zero-copy)
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.dim..(i + 1) * self.dim]
    }

    /// Iterate over rows
    pub fn rows(&self) -> impl Iterator<Item = &[f32]> {
        self.data.chunks_exact(self.dim)
    }

    /// Full row-major data
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// L2-normalize every row in place
    ///
    /// Zero rows are left untouched (a zero vector has no direction).
    pub fn normalize_rows(&mut self) {
        for row in self.data.chunks_exact_mut(self.dim) {
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm > 0.0 {
                for x in row.iter_mut() {
                    *x /= norm;
                }
            }
        }
    }

    /// Copy with normalized rows
    pub fn normalized(&self) -> Tensor {
        let mut out = self.clone();
        out.normalize_rows();
        out
    }

    /// Memory size in bytes
    pub fn memory_size(&self) -> usize {
        self.data.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_shape() {
        let t = Tensor::new(vec![1.0; 6], 3).unwrap();
        assert_eq!(t.num_tokens(), 2);
        assert_eq!(t.dim(), 3);
        assert_eq!(t.row(1), &[1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_tensor_bad_shape() {
        assert!(Tensor::new(vec![1.0; 5], 3).is_err());
    }

    #[test]
    fn test_normalize_rows() {
        let mut t = Tensor::new(vec![3.0, 4.0, 0.0, 0.0], 2).unwrap();
        t.normalize_rows();
        assert!((t.row(0)[0] - 0.6).abs() < 1e-6);
        assert!((t.row(0)[1] - 0.8).abs() < 1e-6);
        // zero row stays zero
        assert_eq!(t.row(1), &[0.0, 0.0]);
    }

    #[test]
    fn test_from_rows() {
        let t = Tensor::from_rows(&[vec![1.0, 2.0], vec![3.0, 4.0]]).unwrap();
        assert_eq!(t.num_tokens(), 2);
        assert_eq!(t.row(1), &[3.0, 4.0]);
    }
}
