//! Product quantizer for residual vectors
//!
//! Splits a D-dimensional residual into M sub-vectors of width D/M and
//! encodes each as the index of its nearest sub-centroid among 2^nbits
//! learned by k-means. Decoding concatenates the chosen sub-centroids.

use super::kmeans::{self, KmeansParams};
use super::{pack_lsb, unpack_lsb};
use crate::schema::{put_f32_slice, Reader};
use crate::{LateError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct ProductQuantizer {
    m: u8,
    nbits: u8,
    dim: usize,
    /// Sub-vector width D / M
    dsub: usize,
    /// Sub-centroid count 2^nbits
    ksub: usize,
    /// `m * ksub * dsub`, grouped by sub-quantizer
    centroids: Vec<f32>,
}

impl ProductQuantizer {
    /// Train every sub-quantizer on the sampled residual rows
    pub fn train(
        residuals: &[f32],
        dim: usize,
        m: u8,
        nbits: u8,
        iterations: usize,
        seed: u64,
    ) -> Result<Self> {
        if m == 0 || dim == 0 || dim % m as usize != 0 {
            return Err(LateError::InvalidTraining(format!(
                "dimension {} does not split into {} sub-quantizers",
                dim, m
            )));
        }
        if !(1..=8).contains(&nbits) {
            return Err(LateError::InvalidTraining(format!(
                "pq nbits {} out of range",
                nbits
            )));
        }
        if residuals.is_empty() {
            return Err(LateError::InvalidTraining(
                "empty residual sample for pq".into(),
            ));
        }
        debug_assert_eq!(residuals.len() % dim, 0);

        let n = residuals.len() / dim;
        let dsub = dim / m as usize;
        let ksub = 1usize << nbits;

        let mut centroids = Vec::with_capacity(m as usize * ksub * dsub);
        let mut sub = vec![0.0f32; n * dsub];
        for s in 0..m as usize {
            for i in 0..n {
                let src = &residuals[i * dim + s * dsub..i * dim + (s + 1) * dsub];
                sub[i * dsub..(i + 1) * dsub].copy_from_slice(src);
            }
            let table = kmeans::train(
                &sub,
                dsub,
                &KmeansParams {
                    k: ksub,
                    iterations,
                    // vary the seed per sub-quantizer, still deterministic
                    seed: seed.wrapping_add(s as u64),
                    spherical: false,
                },
            )?;
            centroids.extend_from_slice(&table);
        }

        Ok(Self {
            m,
            nbits,
            dim,
            dsub,
            ksub,
            centroids,
        })
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn num_subquantizers(&self) -> u8 {
        self.m
    }

    pub fn nbits(&self) -> u8 {
        self.nbits
    }

    /// Bytes per encoded token
    pub fn code_len(&self) -> usize {
        (self.m as usize * self.nbits as usize + 7) / 8
    }

    fn sub_table(&self, s: usize) -> &[f32] {
        let stride = self.ksub * self.dsub;
        &self.centroids[s * stride..(s + 1) * stride]
    }

    /// Append the packed code of one residual row
    pub fn encode_into(&self, row: &[f32], out: &mut Vec<u8>) -> Result<()> {
        if row.len() != self.dim {
            return Err(LateError::DimensionMismatch {
                expected: self.dim,
                got: row.len(),
            });
        }
        let codes: Vec<u8> = (0..self.m as usize)
            .map(|s| {
                let sub = &row[s * self.dsub..(s + 1) * self.dsub];
                kmeans::nearest(self.sub_table(s), self.ksub, self.dsub, sub).0 as u8
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
            return Err(LateError::Corruption("pq code truncated".into()));
        }
        let mut codes = Vec::with_capacity(self.m as usize);
        unpack_lsb(code, self.nbits, self.m as usize, &mut codes);
        for (s, &c) in codes.iter().enumerate() {
            let c = (c as usize).min(self.ksub - 1);
            let table = self.sub_table(s);
            let src = &table[c * self.dsub..(c + 1) * self.dsub];
            out[s * self.dsub..(s + 1) * self.dsub].copy_from_slice(src);
        }
        Ok(())
    }

    /// Wire format: `M u8 | nbits u8 | D u32 | subcentroids`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6 + 4 * self.centroids.len());
        buf.push(self.m);
        buf.push(self.nbits);
        buf.extend_from_slice(&(self.dim as u32).to_be_bytes());
        put_f32_slice(&mut buf, &self.centroids);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let m = r.u8()?;
        let nbits = r.u8()?;
        let dim = r.u32()? as usize;
        if m == 0 || dim == 0 || dim % m as usize != 0 || !(1..=8).contains(&nbits) {
            return Err(LateError::Corruption("bad pq header".into()));
        }
        let dsub = dim / m as usize;
        let ksub = 1usize << nbits;
        let centroids = r.f32_vec(m as usize * ksub * dsub)?;
        Ok(Self {
            m,
            nbits,
            dim,
            dsub,
            ksub,
            centroids,
        })
    }
}
