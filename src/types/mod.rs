//! Core data types: identifiers, field values, documents

pub mod tensor;

pub use tensor::Tensor;

use serde::{Deserialize, Serialize};

/// Tenant namespace identifier
///
/// All inverted, forward and stored keys are prefixed by tenant so one
/// tenant's scans never observe another's documents.
pub type TenantId = u64;

/// Caller-supplied document identifier, unique within a tenant
pub type DocId = u64;

/// Ordinal of a field in the schema
pub type FieldId = u16;

/// Identifier of a coarse-quantizer centroid
pub type CentroidId = u32;

/// A typed field value on a document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Float(f32),
    Text(String),
    /// Epoch microseconds
    DateTime(i64),
    Tensor(Tensor),
    /// Precomputed residual codes with their centroid assignment
    QuantizedTensor(QuantizedTensor),
}

impl FieldValue {
    /// Human-readable type name, used in validation errors
    pub fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Integer(_) => "integer",
            FieldValue::Float(_) => "float",
            FieldValue::Text(_) => "text",
            FieldValue::DateTime(_) => "datetime",
            FieldValue::Tensor(_) => "tensor",
            FieldValue::QuantizedTensor(_) => "quantized_tensor",
        }
    }
}

/// Precomputed per-token codes, bypassing the encode step at add time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuantizedTensor {
    /// Nearest-centroid assignment per token
    pub centroid_ids: Vec<CentroidId>,
    /// Packed residual codes, token-aligned
    pub codes: Vec<u8>,
}

/// A document: caller-supplied id plus named field values
#[derive(Debug, Clone)]
pub struct Document {
    pub id: DocId,
    pub fields: Vec<(String, FieldValue)>,
}

impl Document {
    pub fn new(id: DocId) -> Self {
        Self {
            id,
            fields: Vec::new(),
        }
    }

    /// Add a field value (builder style)
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.push((name.into(), value));
        self
    }

    /// Look up a field value by name
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_builder() {
        let doc = Document::new(7)
            .with_field("title", FieldValue::Text("hello".into()))
            .with_field("year", FieldValue::Integer(2024));

        assert_eq!(doc.id, 7);
        assert_eq!(
            doc.field("title"),
            Some(&FieldValue::Text("hello".into()))
        );
        assert!(doc.field("missing").is_none());
    }
}
