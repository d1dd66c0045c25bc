//! Residual codecs
//!
//! One codec per indexed tensor field, chosen by the schema: a no-op
//! float passthrough, the trained bit-level binarizer, or a product
//! quantizer. Codecs are tagged variants, not trait objects; the writer
//! and retriever dispatch on the tag.

pub mod binarizer;
pub mod kmeans;
pub mod pq;

pub use binarizer::Binarizer;
pub use pq::ProductQuantizer;

use crate::schema::{FieldParameters, QuantizerType, Reader};
use crate::{LateError, Result};

/// Pack sub-byte codes LSB-first, in declaration order
pub(crate) fn pack_lsb(codes: &[u8], nbits: u8, out: &mut Vec<u8>) {
    let mut acc: u32 = 0;
    let mut filled: u32 = 0;
    for &code in codes {
        acc |= (code as u32) << filled;
        filled += nbits as u32;
        while filled >= 8 {
            out.push((acc & 0xFF) as u8);
            acc >>= 8;
            filled -= 8;
        }
    }
    if filled > 0 {
        out.push((acc & 0xFF) as u8);
    }
}

/// Inverse of [`pack_lsb`]
pub(crate) fn unpack_lsb(bytes: &[u8], nbits: u8, count: usize, out: &mut Vec<u8>) {
    let mask: u32 = (1u32 << nbits) - 1;
    let mut acc: u32 = 0;
    let mut filled: u32 = 0;
    let mut iter = bytes.iter();
    for _ in 0..count {
        while filled < nbits as u32 {
            acc |= (*iter.next().unwrap_or(&0) as u32) << filled;
            filled += 8;
        }
        out.push((acc & mask) as u8);
        acc >>= nbits as u32;
        filled -= nbits as u32;
    }
}

/// A field's residual encoder
#[derive(Debug, Clone, PartialEq)]
pub enum ResidualCodec {
    /// Raw float passthrough (debug / reference); decode equals input
    Raw { dim: usize },
    Binarizer(Binarizer),
    Pq(ProductQuantizer),
}

impl ResidualCodec {
    /// Train the codec declared by `params` on sampled residual rows
    pub fn train(params: &FieldParameters, residuals: &[f32], seed: u64) -> Result<Self> {
        let dim = params.dimensions as usize;
        match params.quantization {
            QuantizerType::None => Ok(ResidualCodec::Raw { dim }),
            QuantizerType::Binarizer => Ok(ResidualCodec::Binarizer(Binarizer::train(
                residuals,
                dim,
                params.nbits,
            )?)),
            QuantizerType::ProductEncoder => Ok(ResidualCodec::Pq(ProductQuantizer::train(
                residuals,
                dim,
                params.num_subquantizers,
                params.nbits,
                params.num_iterations as usize,
                seed,
            )?)),
        }
    }

    pub fn quantizer_type(&self) -> QuantizerType {
        match self {
            ResidualCodec::Raw { .. } => QuantizerType::None,
            ResidualCodec::Binarizer(_) => QuantizerType::Binarizer,
            ResidualCodec::Pq(_) => QuantizerType::ProductEncoder,
        }
    }

    pub fn dim(&self) -> usize {
        match self {
            ResidualCodec::Raw { dim } => *dim,
            ResidualCodec::Binarizer(b) => b.dim(),
            ResidualCodec::Pq(pq) => pq.dim(),
        }
    }

    /// Bits per encoded token
    pub fn bits_per_token(&self) -> usize {
        match self {
            ResidualCodec::Raw { dim } => 32 * dim,
            ResidualCodec::Binarizer(b) => b.nbits() as usize * b.dim(),
            ResidualCodec::Pq(pq) => {
                pq.nbits() as usize * pq.num_subquantizers() as usize
            }
        }
    }

    /// Bytes per encoded token (token codes are byte-aligned)
    pub fn code_len(&self) -> usize {
        (self.bits_per_token() + 7) / 8
    }

    /// Append the code of one residual row
    pub fn encode_into(&self, row: &[f32], out: &mut Vec<u8>) -> Result<()> {
        match self {
            ResidualCodec::Raw { dim } => {
                if row.len() != *dim {
                    return Err(LateError::DimensionMismatch {
                        expected: *dim,
                        got: row.len(),
                    });
                }
                for v in row {
                    out.extend_from_slice(&v.to_bits().to_be_bytes());
                }
                Ok(())
            }
            ResidualCodec::Binarizer(b) => b.encode_into(row, out),
            ResidualCodec::Pq(pq) => pq.encode_into(row, out),
        }
    }

    /// Decode one token code into `out`
    pub fn decode_into(&self, code: &[u8], out: &mut [f32]) -> Result<()> {
        match self {
            ResidualCodec::Raw { dim } => {
                if out.len() != *dim {
                    return Err(LateError::DimensionMismatch {
                        expected: *dim,
                        got: out.len(),
                    });
                }
                if code.len() < 4 * dim {
                    return Err(LateError::Corruption("raw residual truncated".into()));
                }
                for (slot, chunk) in out.iter_mut().zip(code.chunks_exact(4)) {
                    *slot = f32::from_bits(u32::from_be_bytes([
                        chunk[0], chunk[1], chunk[2], chunk[3],
                    ]));
                }
                Ok(())
            }
            ResidualCodec::Binarizer(b) => b.decode_into(code, out),
            ResidualCodec::Pq(pq) => pq.decode_into(code, out),
        }
    }

    /// Serialize as a tagged blob for the meta column family
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            ResidualCodec::Raw { dim } => {
                let mut buf = vec![QuantizerType::None as u8];
                buf.extend_from_slice(&(*dim as u32).to_be_bytes());
                buf
            }
            ResidualCodec::Binarizer(b) => {
                let mut buf = vec![QuantizerType::Binarizer as u8];
                buf.extend_from_slice(&b.to_bytes());
                buf
            }
            ResidualCodec::Pq(pq) => {
                let mut buf = vec![QuantizerType::ProductEncoder as u8];
                buf.extend_from_slice(&pq.to_bytes());
                buf
            }
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let tag = *data
            .first()
            .ok_or_else(|| LateError::Corruption("empty codec blob".into()))?;
        let body = &data[1..];
        match tag {
            0 => {
                let mut r = Reader::new(body);
                Ok(ResidualCodec::Raw {
                    dim: r.u32()? as usize,
                })
            }
            1 => Ok(ResidualCodec::Binarizer(Binarizer::from_bytes(body)?)),
            2 => Ok(ResidualCodec::Pq(ProductQuantizer::from_bytes(body)?)),
            _ => Err(LateError::Corruption(format!("unknown codec tag {}", tag))),
        }
    }
}
