//! Writer: validated, atomic document mutations
//!
//! Every operation builds exactly one write batch: prior state of each
//! touched document is cleared first (idempotent upsert), then the new
//! forward, inverted, doclen and stored entries are queued, and the
//! batch commits as a unit. A failed commit leaves the index at its
//! pre-call state; readers never observe partial documents.

use crate::index::{forward, inverted, stored, TrainedState};
use crate::schema::{DataType, Field, Schema};
use crate::storage::{KvEngine, WriteBatch};
use crate::types::{CentroidId, DocId, Document, FieldValue, TenantId};
use crate::{LateError, Result};
use std::collections::BTreeMap;

pub struct Writer<'a> {
    engine: &'a KvEngine,
    schema: &'a Schema,
    trained: &'a TrainedState,
}

/// Encoded tensor field, ready to be queued
struct EncodedField {
    field_id: u16,
    centroid_ids: Vec<CentroidId>,
    codes: Vec<u8>,
    counts: BTreeMap<CentroidId, u32>,
}

impl<'a> Writer<'a> {
    pub fn new(engine: &'a KvEngine, schema: &'a Schema, trained: &'a TrainedState) -> Self {
        Self {
            engine,
            schema,
            trained,
        }
    }

    /// Atomic upsert: re-adding an existing id replaces the document
    pub fn add(&self, tenant: TenantId, docs: &[Document]) -> Result<()> {
        let mut batch = WriteBatch::new();
        for doc in docs {
            self.queue_document(&mut batch, tenant, doc)?;
        }
        tracing::debug!(tenant, docs = docs.len(), ops = batch.len(), "writer add");
        self.engine.commit(batch)
    }

    /// Atomic delete of the given ids
    pub fn remove(&self, tenant: TenantId, ids: &[DocId]) -> Result<()> {
        let mut batch = WriteBatch::new();
        for &id in ids {
            self.queue_clear(&mut batch, tenant, id)?;
        }
        tracing::debug!(tenant, docs = ids.len(), "writer remove");
        self.engine.commit(batch)
    }

    /// Remove-then-add inside one batch; equivalent to re-`add`
    pub fn update(&self, tenant: TenantId, docs: &[Document]) -> Result<()> {
        self.add(tenant, docs)
    }

    fn queue_clear(&self, batch: &mut WriteBatch, tenant: TenantId, doc: DocId) -> Result<()> {
        inverted::clear_postings(self.engine, batch, tenant, doc)?;
        forward::clear_forward(self.engine, batch, tenant, doc)?;
        stored::clear_stored(self.engine, batch, tenant, doc)?;
        Ok(())
    }

    fn queue_document(
        &self,
        batch: &mut WriteBatch,
        tenant: TenantId,
        doc: &Document,
    ) -> Result<()> {
        self.validate(doc)?;

        // encode before queuing anything, so validation or training
        // errors leave the batch untouched
        let mut encoded = Vec::new();
        for field_id in self.schema.indexed_tensor_fields() {
            let field = self.schema.field_by_id(field_id).unwrap();
            let value = doc.field(&field.name).ok_or_else(|| {
                LateError::InvalidSchema(format!(
                    "document {} is missing indexed field '{}'",
                    doc.id, field.name
                ))
            })?;
            encoded.push(self.encode_field(field_id, field, value)?);
        }

        self.queue_clear(batch, tenant, doc.id)?;

        for enc in encoded {
            inverted::write_postings(batch, tenant, doc.id, &enc.counts);
            forward::write_forward(
                batch,
                tenant,
                doc.id,
                enc.field_id,
                &enc.centroid_ids,
                &enc.codes,
            );
        }

        for (name, value) in &doc.fields {
            let (field_id, field) = self.schema.field(name).unwrap();
            if field.is_stored() || field.is_context() {
                stored::write_stored(batch, tenant, doc.id, field_id, value)?;
            }
        }
        Ok(())
    }

    fn validate(&self, doc: &Document) -> Result<()> {
        for (name, value) in &doc.fields {
            let (_, field) = self
                .schema
                .field(name)
                .ok_or_else(|| LateError::UnknownField(name.clone()))?;
            check_type(field, value)?;
        }
        Ok(())
    }

    fn encode_field(
        &self,
        field_id: u16,
        field: &Field,
        value: &FieldValue,
    ) -> Result<EncodedField> {
        let tables = self
            .trained
            .field(field_id)
            .ok_or(LateError::IndexUntrained)?;
        let dim = field.params.dimensions as usize;

        let (centroid_ids, codes) = match value {
            FieldValue::Tensor(tensor) => {
                if tensor.dim() != dim {
                    return Err(LateError::DimensionMismatch {
                        expected: dim,
                        got: tensor.dim(),
                    });
                }
                let normalized = tensor.normalized();
                let mut centroid_ids = Vec::with_capacity(normalized.num_tokens());
                let mut codes =
                    Vec::with_capacity(normalized.num_tokens() * tables.codec.code_len());
                let mut residual = vec![0.0f32; dim];
                for row in normalized.rows() {
                    let centroid = tables.coarse.assign(row)?;
                    let c = tables.coarse.centroid(centroid);
                    for ((r, &x), &y) in residual.iter_mut().zip(row).zip(c) {
                        *r = x - y;
                    }
                    tables.codec.encode_into(&residual, &mut codes)?;
                    centroid_ids.push(centroid);
                }
                (centroid_ids, codes)
            }
            FieldValue::QuantizedTensor(q) => {
                // precomputed codes skip the encode step but still get
                // shape-checked against the field's codec
                let expect = q.centroid_ids.len() * tables.codec.code_len();
                if q.codes.len() != expect {
                    return Err(LateError::DimensionMismatch {
                        expected: expect,
                        got: q.codes.len(),
                    });
                }
                let k = tables.coarse.num_centroids() as u32;
                if let Some(&bad) = q.centroid_ids.iter().find(|&&c| c >= k) {
                    return Err(LateError::InvalidArgument(format!(
                        "centroid id {} out of range for field '{}'",
                        bad, field.name
                    )));
                }
                (q.centroid_ids.clone(), q.codes.clone())
            }
            other => {
                return Err(LateError::InvalidSchema(format!(
                    "field '{}' expects a tensor value, got {}",
                    field.name,
                    other.type_name()
                )))
            }
        };

        let mut counts = BTreeMap::new();
        for &c in &centroid_ids {
            *counts.entry(c).or_insert(0u32) += 1;
        }

        Ok(EncodedField {
            field_id,
            centroid_ids,
            codes,
            counts,
        })
    }
}

fn check_type(field: &Field, value: &FieldValue) -> Result<()> {
    let ok = matches!(
        (field.data_type, value),
        (DataType::Integer, FieldValue::Integer(_))
            | (DataType::Float, FieldValue::Float(_))
            | (DataType::Text, FieldValue::Text(_))
            | (DataType::DateTime, FieldValue::DateTime(_))
            | (DataType::Tensor, FieldValue::Tensor(_))
            | (DataType::Tensor, FieldValue::QuantizedTensor(_))
            | (DataType::QuantizedTensor, FieldValue::QuantizedTensor(_))
    );
    if ok {
        Ok(())
    } else {
        Err(LateError::InvalidSchema(format!(
            "field '{}' declared {:?} but value is {}",
            field.name,
            field.data_type,
            value.type_name()
        )))
    }
}
