//! Schema: field declarations fixed at index creation
//!
//! A schema is an ordered set of typed fields. Each field declares a
//! role mask (indexed / stored / context) and, for indexed tensor
//! fields, its quantization parameters. The schema is persisted to the
//! meta column family as a versioned binary blob and re-read on open;
//! adding fields to an existing index is not supported.

use crate::{LateError, Result};
use crate::types::FieldId;

/// Closed set of field data types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Integer = 0,
    Float = 1,
    Text = 2,
    DateTime = 3,
    Tensor = 4,
    QuantizedTensor = 5,
}

impl DataType {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => DataType::Integer,
            1 => DataType::Float,
            2 => DataType::Text,
            3 => DataType::DateTime,
            4 => DataType::Tensor,
            5 => DataType::QuantizedTensor,
            _ => {
                return Err(LateError::Corruption(format!(
                    "unknown data type tag {}",
                    v
                )))
            }
        })
    }
}

/// Field role bitmask
pub mod role {
    /// Participates in retrieval
    pub const INDEXED: u8 = 1 << 0;
    /// Returned with results
    pub const STORED: u8 = 1 << 1;
    /// Auxiliary data available to scoring
    pub const CONTEXT: u8 = 1 << 2;
}

/// Residual quantizer kind for indexed tensor fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizerType {
    /// Store raw float residuals (debug / reference)
    None = 0,
    /// Bit-level residual coder with trained bucket cutoffs and weights
    Binarizer = 1,
    /// Product quantizer
    ProductEncoder = 2,
}

impl QuantizerType {
    fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => QuantizerType::None,
            1 => QuantizerType::Binarizer,
            2 => QuantizerType::ProductEncoder,
            _ => {
                return Err(LateError::Corruption(format!(
                    "unknown quantizer tag {}",
                    v
                )))
            }
        })
    }
}

/// Per-field parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldParameters {
    /// Embedding dimension (tensor fields)
    pub dimensions: u32,
    /// Residual quantizer kind
    pub quantization: QuantizerType,
    /// Coarse codebook size K
    pub num_centroids: u32,
    /// k-means iterations during training
    pub num_iterations: u32,
    /// PQ sub-quantizer count M
    pub num_subquantizers: u8,
    /// Bits per dimension (binarizer) or per sub-quantizer (PQ)
    pub nbits: u8,
}

impl Default for FieldParameters {
    fn default() -> Self {
        Self {
            dimensions: 0,
            quantization: QuantizerType::None,
            num_centroids: 0,
            num_iterations: 10,
            num_subquantizers: 0,
            nbits: 1,
        }
    }
}

/// A named, typed field declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub data_type: DataType,
    pub roles: u8,
    pub params: FieldParameters,
}

impl Field {
    pub fn new(
        name: impl Into<String>,
        data_type: DataType,
        roles: u8,
        params: FieldParameters,
    ) -> Self {
        Self {
            name: name.into(),
            data_type,
            roles,
            params,
        }
    }

    /// Indexed tensor field (the usual ColBERT-style field)
    pub fn indexed(name: impl Into<String>, data_type: DataType, params: FieldParameters) -> Self {
        Self::new(name, data_type, role::INDEXED, params)
    }

    /// Stored-only field, returned with results
    pub fn stored(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, role::STORED, FieldParameters::default())
    }

    /// Context field, available to scoring
    pub fn context(name: impl Into<String>, data_type: DataType) -> Self {
        Self::new(name, data_type, role::CONTEXT, FieldParameters::default())
    }

    pub fn is_indexed(&self) -> bool {
        self.roles & role::INDEXED != 0
    }

    pub fn is_stored(&self) -> bool {
        self.roles & role::STORED != 0
    }

    pub fn is_context(&self) -> bool {
        self.roles & role::CONTEXT != 0
    }

    /// Indexed per-token vector field that drives retrieval
    pub fn is_indexed_tensor(&self) -> bool {
        self.is_indexed()
            && matches!(
                self.data_type,
                DataType::Tensor | DataType::QuantizedTensor
            )
    }
}

/// Serialization format version of the schema blob
const SCHEMA_FORMAT: u32 = 1;

/// Ordered set of fields
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Schema {
    fields: Vec<Field>,
}

impl Schema {
    pub fn new(fields: Vec<Field>) -> Result<Self> {
        let schema = Self { fields };
        schema.validate()?;
        Ok(schema)
    }

    fn validate(&self) -> Result<()> {
        if self.fields.is_empty() {
            return Err(LateError::InvalidSchema("schema has no fields".into()));
        }
        if self.fields.len() > u16::MAX as usize {
            return Err(LateError::InvalidSchema("too many fields".into()));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(LateError::InvalidSchema("empty field name".into()));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(LateError::InvalidSchema(format!(
                    "duplicate field name '{}'",
                    field.name
                )));
            }
            if field.is_indexed_tensor() {
                let p = &field.params;
                if p.dimensions == 0 {
                    return Err(LateError::InvalidSchema(format!(
                        "indexed tensor field '{}' needs dimensions > 0",
                        field.name
                    )));
                }
                if p.num_centroids == 0 {
                    return Err(LateError::InvalidSchema(format!(
                        "indexed tensor field '{}' needs num_centroids > 0",
                        field.name
                    )));
                }
                match p.quantization {
                    QuantizerType::Binarizer => {
                        if p.nbits == 0 || p.nbits > 8 {
                            return Err(LateError::InvalidSchema(format!(
                                "field '{}': binarizer nbits must be in 1..=8",
                                field.name
                            )));
                        }
                    }
                    QuantizerType::ProductEncoder => {
                        if p.num_subquantizers == 0
                            || p.dimensions % p.num_subquantizers as u32 != 0
                        {
                            return Err(LateError::InvalidSchema(format!(
                                "field '{}': dimensions must divide evenly into sub-quantizers",
                                field.name
                            )));
                        }
                        if p.nbits == 0 || p.nbits > 8 {
                            return Err(LateError::InvalidSchema(format!(
                                "field '{}': pq nbits must be in 1..=8",
                                field.name
                            )));
                        }
                    }
                    QuantizerType::None => {}
                }
            }
        }
        Ok(())
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Field id (schema position) and declaration by name
    pub fn field(&self, name: &str) -> Option<(FieldId, &Field)> {
        self.fields
            .iter()
            .position(|f| f.name == name)
            .map(|i| (i as FieldId, &self.fields[i]))
    }

    pub fn field_by_id(&self, id: FieldId) -> Option<&Field> {
        self.fields.get(id as usize)
    }

    /// Ids of all indexed tensor fields, in schema order
    pub fn indexed_tensor_fields(&self) -> Vec<FieldId> {
        self.fields
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_indexed_tensor())
            .map(|(i, _)| i as FieldId)
            .collect()
    }

    /// Serialize to the on-disk blob
    ///
    /// Layout, all big-endian:
    /// `format u32 | field_count u32 | per field:
    ///  name_len u16 | name | type u8 | role_mask u8 |
    ///  dimensions u32 | quantization u8 | num_centroids u32 |
    ///  num_iterations u32 | num_subquantizers u8 | nbits u8`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16 + self.fields.len() * 32);
        buf.extend_from_slice(&SCHEMA_FORMAT.to_be_bytes());
        buf.extend_from_slice(&(self.fields.len() as u32).to_be_bytes());
        for f in &self.fields {
            buf.extend_from_slice(&(f.name.len() as u16).to_be_bytes());
            buf.extend_from_slice(f.name.as_bytes());
            buf.push(f.data_type as u8);
            buf.push(f.roles);
            buf.extend_from_slice(&f.params.dimensions.to_be_bytes());
            buf.push(f.params.quantization as u8);
            buf.extend_from_slice(&f.params.num_centroids.to_be_bytes());
            buf.extend_from_slice(&f.params.num_iterations.to_be_bytes());
            buf.push(f.params.num_subquantizers);
            buf.push(f.params.nbits);
        }
        buf
    }

    /// Parse the on-disk blob
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut r = Reader::new(data);
        let format = r.u32()?;
        if format != SCHEMA_FORMAT {
            return Err(LateError::Corruption(format!(
                "unsupported schema format {}",
                format
            )));
        }
        let count = r.u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = r.u16()? as usize;
            let name = String::from_utf8(r.bytes(name_len)?.to_vec())
                .map_err(|e| LateError::Corruption(format!("bad field name: {}", e)))?;
            let data_type = DataType::from_u8(r.u8()?)?;
            let roles = r.u8()?;
            let params = FieldParameters {
                dimensions: r.u32()?,
                quantization: QuantizerType::from_u8(r.u8()?)?,
                num_centroids: r.u32()?,
                num_iterations: r.u32()?,
                num_subquantizers: r.u8()?,
                nbits: r.u8()?,
            };
            fields.push(Field {
                name,
                data_type,
                roles,
                params,
            });
        }
        Schema::new(fields)
    }
}

/// Cursor over a big-endian byte buffer
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(LateError::Corruption("record truncated".into()));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    pub(crate) fn f32_vec(&mut self, n: usize) -> Result<Vec<f32>> {
        let b = self.bytes(n * 4)?;
        Ok(b.chunks_exact(4)
            .map(|c| f32::from_bits(u32::from_be_bytes([c[0], c[1], c[2], c[3]])))
            .collect())
    }
}

/// Append a f32 slice as big-endian bit patterns
pub(crate) fn put_f32_slice(buf: &mut Vec<u8>, values: &[f32]) {
    buf.reserve(values.len() * 4);
    for v in values {
        buf.extend_from_slice(&v.to_bits().to_be_bytes());
    }
}
