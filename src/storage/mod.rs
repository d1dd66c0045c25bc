//! Column-family KV storage
//!
//! ## Architecture
//! - **Engine**: multi-version in-memory tables, one per column family,
//!   committed in atomic batches with snapshot reads
//! - **WAL**: append-only checksummed log replayed on open
//! - **Checkpoint**: compressed per-family dump of the latest committed
//!   state; the WAL is truncated after a successful checkpoint
//!
//! Keys are fully-encoded byte strings; every integer component is
//! big-endian so lexicographic byte order equals numeric order.

mod checkpoint;
mod engine;
mod wal;

pub use engine::{KvEngine, Snapshot, WriteBatch};

use crate::types::{CentroidId, DocId, FieldId, TenantId};
use serde::{Deserialize, Serialize};

/// Fixed set of column families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ColumnFamily {
    /// (tenant, centroid, doc) -> token count; posting lists in doc order
    Inverted = 0,
    /// (tenant, doc, centroid) -> token count; unwinds postings on delete
    InvertedCounts = 1,
    /// (tenant, doc, field) -> packed (T, centroid_ids, codes)
    ForwardCodes = 2,
    /// (tenant, doc, field) -> token count
    DocLens = 3,
    /// (tenant, doc, field) -> serialized field value
    StoredFields = 4,
    /// schema, version, centroid tables, codec tables
    Meta = 5,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 6] = [
        ColumnFamily::Inverted,
        ColumnFamily::InvertedCounts,
        ColumnFamily::ForwardCodes,
        ColumnFamily::DocLens,
        ColumnFamily::StoredFields,
        ColumnFamily::Meta,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Self::ALL.get(v as usize).copied()
    }
}

/// One operation inside a write batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BatchOp {
    Put {
        cf: ColumnFamily,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        cf: ColumnFamily,
        key: Vec<u8>,
    },
}

// ── Key encoding ────────────────────────────────────────────────────────

/// Inverted key: tenant u64 | centroid u32 | doc u64
pub fn inverted_key(tenant: TenantId, centroid: CentroidId, doc: DocId) -> Vec<u8> {
    let mut k = Vec::with_capacity(20);
    k.extend_from_slice(&tenant.to_be_bytes());
    k.extend_from_slice(&centroid.to_be_bytes());
    k.extend_from_slice(&doc.to_be_bytes());
    k
}

/// Prefix covering one posting list
pub fn inverted_prefix(tenant: TenantId, centroid: CentroidId) -> Vec<u8> {
    let mut k = Vec::with_capacity(12);
    k.extend_from_slice(&tenant.to_be_bytes());
    k.extend_from_slice(&centroid.to_be_bytes());
    k
}

/// Doc id from the tail of an inverted key
pub fn inverted_key_doc(key: &[u8]) -> Option<DocId> {
    key.get(12..20)
        .map(|b| DocId::from_be_bytes(b.try_into().unwrap()))
}

/// Counts key: tenant u64 | doc u64 | centroid u32
pub fn inverted_counts_key(tenant: TenantId, doc: DocId, centroid: CentroidId) -> Vec<u8> {
    let mut k = Vec::with_capacity(20);
    k.extend_from_slice(&tenant.to_be_bytes());
    k.extend_from_slice(&doc.to_be_bytes());
    k.extend_from_slice(&centroid.to_be_bytes());
    k
}

/// Prefix covering all counts of one document
pub fn inverted_counts_prefix(tenant: TenantId, doc: DocId) -> Vec<u8> {
    doc_prefix(tenant, doc)
}

/// Centroid id from the tail of a counts key
pub fn inverted_counts_key_centroid(key: &[u8]) -> Option<CentroidId> {
    key.get(16..20)
        .map(|b| CentroidId::from_be_bytes(b.try_into().unwrap()))
}

/// Forward / doclen / stored key: tenant u64 | doc u64 | field u16
pub fn doc_field_key(tenant: TenantId, doc: DocId, field: FieldId) -> Vec<u8> {
    let mut k = Vec::with_capacity(18);
    k.extend_from_slice(&tenant.to_be_bytes());
    k.extend_from_slice(&doc.to_be_bytes());
    k.extend_from_slice(&field.to_be_bytes());
    k
}

/// Prefix covering every per-field record of one document
pub fn doc_prefix(tenant: TenantId, doc: DocId) -> Vec<u8> {
    let mut k = Vec::with_capacity(16);
    k.extend_from_slice(&tenant.to_be_bytes());
    k.extend_from_slice(&doc.to_be_bytes());
    k
}

/// Prefix covering a whole tenant
pub fn tenant_prefix(tenant: TenantId) -> Vec<u8> {
    tenant.to_be_bytes().to_vec()
}

/// Field id from the tail of a doc-field key
pub fn doc_field_key_field(key: &[u8]) -> Option<FieldId> {
    key.get(16..18)
        .map(|b| FieldId::from_be_bytes(b.try_into().unwrap()))
}

/// Doc id from the middle of a doc-field key
pub fn doc_field_key_doc(key: &[u8]) -> Option<DocId> {
    key.get(8..16)
        .map(|b| DocId::from_be_bytes(b.try_into().unwrap()))
}

/// Meta keys are plain utf8 names
pub fn meta_key(name: &str) -> Vec<u8> {
    name.as_bytes().to_vec()
}
