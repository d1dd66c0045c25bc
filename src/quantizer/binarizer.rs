//! Bit-level residual coder with trained bucket cutoffs and weights
//!
//! Residual = token vector minus its assigned centroid. Each dimension
//! gets `nbits` quantile cutoffs learned from sampled residuals, which
//! split the line into `nbits + 1` buckets encoded as the bucket
//! ordinal in `nbits` bits (valid because nbits + 1 <= 2^nbits).
//! Bucket 0 (below every cutoff) decodes to `-avg_residual`; bucket
//! c > 0 decodes to that dimension's trained weight `c - 1`.

use super::{pack_lsb, unpack_lsb};
use crate::schema::{put_f32_slice, Reader};
use crate::{LateError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Binarizer {
    nbits: u8,
    dim: usize,
    /// Per-dimension ascending cutoffs, `nbits * dim`
    bucket_cutoffs: Vec<f32>,
    /// Per-dimension bucket representatives, `nbits * dim`
    bucket_weights: Vec<f32>,
    /// Mean |residual| over the training sample
    avg_residual: f32,
}

impl Binarizer {
    /// Learn cutoffs and weights from sampled residual rows
    pub fn train(residuals: &[f32], dim: usize, nbits: u8) -> Result<Self> {
        if !(1..=8).contains(&nbits) {
            return Err(LateError::InvalidTraining(format!(
                "binarizer nbits {} out of range",
                nbits
            )));
        }
        if dim == 0 || residuals.is_empty() {
            return Err(LateError::InvalidTraining(
                "empty residual sample for binarizer".into(),
            ));
        }
        debug_assert_eq!(residuals.len() % dim, 0);
        let n = residuals.len() / dim;
        let nb = nbits as usize;

        let mut bucket_cutoffs = vec![0.0f32; nb * dim];
        let mut bucket_weights = vec![0.0f32; nb * dim];
        let mut column = vec![0.0f32; n];

        for d in 0..dim {
            for (i, slot) in column.iter_mut().enumerate() {
                *slot = residuals[i * dim + d];
            }
            // total order on f32 keeps training deterministic
            column.sort_by(f32::total_cmp);

            for j in 0..nb {
                let idx = ((j + 1) * n / (nb + 1)).min(n - 1);
                bucket_cutoffs[d * nb + j] = column[idx];
            }

            // weight j represents bucket j + 1 (values at or above cutoff j)
            for j in 0..nb {
                let lo = bucket_cutoffs[d * nb + j];
                let hi = if j + 1 < nb {
                    bucket_cutoffs[d * nb + j + 1]
                } else {
                    f32::INFINITY
                };
                let mut sum = 0.0f64;
                let mut count = 0usize;
                for &v in column.iter() {
                    if v >= lo && v < hi {
                        sum += v as f64;
                        count += 1;
                    }
                }
                bucket_weights[d * nb + j] = if count > 0 {
                    (sum / count as f64) as f32
                } else {
                    lo
                };
            }
        }

        let avg_residual =
            (residuals.iter().map(|v| v.abs() as f64).sum::<f64>() / residuals.len() as f64) as f32;

        Ok(Self {
            nbits,
            dim,
            bucket_cutoffs,
            bucket_weights,
            avg_residual,
        })
    }

    pub fn nbits(&self) -> u8 {
        self.nbits
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn avg_residual(&self) -> f32 {
        self.avg_residual
    }

    pub fn bucket_weights(&self) -> &[f32] {
        &self.bucket_weights
    }

    /// Bytes per encoded token
    pub fn code_len(&self) -> usize {
        (self.dim * self.nbits as usize + 7) / 8
    }

    /// Append the packed code of one residual row
    pub fn encode_into(&self, row: &[f32], out: &mut Vec<u8>) -> Result<()> {
        if row.len() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: row.len(),
            });
        }
        let nb = self.nbits as usize;
        let codes: Vec<u8> = row
            .iter()
            .enumerate()
            .map(|(d, &v)| {
                let cutoffs = &self.bucket_cutoffs[d * nb..(d + 1) * nb];
                cutoffs.iter().filter(|&&c| v >= c).count() as u8
            })
            .collect();
        pack_lsb(&codes, self.nbits, out);
        Ok(())
    }

    /// Decode one packed token code into `out`
    pub fn decode_into(&self, code: &[u8], out: &mut [f32]) -> Result<()> {
        if out.len() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: out.len(),
            });
        }
        if code.len() < self.code_len() {
            return Err(LateError::Corruption("residual code truncated".into()));
        }
        let nb = self.nbits as usize;
        let mut codes = Vec::with_capacity(self.dim);
        unpack_lsb(code, self.nbits, self.dim, &mut codes);
        for (d, (&c, slot)) in codes.iter().zip(out.iter_mut()).enumerate() {
            *slot = if c == 0 {
                -self.avg_residual
            } else {
                let idx = (c as usize - 1).min(nb - 1);
                self.bucket_weights[d * nb + idx]
            };
        }
        Ok(())
    }

    /// Wire format: `nbits u8 | D u32 | cutoffs | weights | avg_residual`
    pub fn to_bytes(&self) -> Vec<u8> {
        let nb = self.nbits as usize;
        let mut buf = Vec::with_capacity(9 + 8 * nb * self.dim);
        buf.push(self.nbits);
        buf.extend_from_slice(&(self.dim as u32).to_be_bytes());
        put_f32_slice(&mut buf, &self.bucket_cutoffs);
        put_f32_slice(&mut buf, &self.bucket_weights);
        put_f32_slice(&mut buf, &[self.avg_residual]);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let nbits = r.u8()?;
        let dim = r.u32()? as usize;
        if !(1..=8).contains(&nbits) || dim == 0 {
            return Err(LateError::Corruption("bad binarizer header".into()));
        }
        let nb = nbits as usize;
        let bucket_cutoffs = r.f32_vec(nb * dim)?;
        let bucket_weights = r.f32_vec(nb * dim)?;
        let avg_residual = r.f32()?;
        Ok(Self {
            nbits,
            dim,
            bucket_cutoffs,
            bucket_weights,
            avg_residual,
        })
    }
}
