//! Forward index: per (doc, field) token records
//!
//! Record layout, big-endian:
//! `u32 T | u32 centroid_ids[T] | codes`
//! where codes holds T token-aligned residual codes. Doc lengths live
//! in their own column family so the retriever can read T without
//! touching the codes.

use crate::storage::{self, ColumnFamily, KvEngine, Snapshot, WriteBatch};
use crate::types::{CentroidId, DocId, FieldId, TenantId};
use crate::{LateError, Result};

/// Decoded forward record
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardRecord {
    pub centroid_ids: Vec<CentroidId>,
    /// Packed residual codes, `centroid_ids.len() * code_len` bytes
    pub codes: Vec<u8>,
}

impl ForwardRecord {
    pub fn token_count(&self) -> usize {
        self.centroid_ids.len()
    }

    /// Code bytes of token `t`
    pub fn token_code(&self, t: usize, code_len: usize) -> &[u8] {
        &self.codes[t * code_len..(t + 1) * code_len]
    }
}

/// Serialize a record
pub fn encode_record(centroid_ids: &[CentroidId], codes: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + centroid_ids.len() * 4 + codes.len());
    buf.extend_from_slice(&(centroid_ids.len() as u32).to_be_bytes());
    for id in centroid_ids {
        buf.extend_from_slice(&id.to_be_bytes());
    }
    buf.extend_from_slice(codes);
    buf
}

/// Parse a record
pub fn decode_record(data: &[u8]) -> Result<ForwardRecord> {
    if data.len() < 4 {
        return Err(LateError::Corruption("forward record truncated".into()));
    }
    let t = u32::from_be_bytes(data[0..4].try_into().unwrap()) as usize;
    let ids_end = 4 + t * 4;
    if data.len() < ids_end {
        return Err(LateError::Corruption("forward record truncated".into()));
    }
    let centroid_ids = data[4..ids_end]
        .chunks_exact(4)
        .map(|c| CentroidId::from_be_bytes(c.try_into().unwrap()))
        .collect();
    Ok(ForwardRecord {
        centroid_ids,
        codes: data[ids_end..].to_vec(),
    })
}

/// Queue the forward record and doc length for one field
pub fn write_forward(
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
    field: FieldId,
    centroid_ids: &[CentroidId],
    codes: &[u8],
) {
    batch.put(
        ColumnFamily::ForwardCodes,
        storage::doc_field_key(tenant, doc, field),
        encode_record(centroid_ids, codes),
    );
    batch.put(
        ColumnFamily::DocLens,
        storage::doc_field_key(tenant, doc, field),
        (centroid_ids.len() as u32).to_be_bytes().to_vec(),
    );
}

/// Queue deletion of every forward record and doc length of a document
pub fn clear_forward(
    engine: &KvEngine,
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
) -> Result<()> {
    let prefix = storage::doc_prefix(tenant, doc);
    for cf in [ColumnFamily::ForwardCodes, ColumnFamily::DocLens] {
        let mut keys = Vec::new();
        engine.scan_prefix_with(cf, &prefix, |key, _| {
            keys.push(key.to_vec());
            Ok(())
        })?;
        for key in keys {
            batch.delete(cf, key);
        }
    }
    Ok(())
}

/// Read one forward record at the snapshot
pub fn read_forward(
    snap: &Snapshot,
    tenant: TenantId,
    doc: DocId,
    field: FieldId,
) -> Result<Option<ForwardRecord>> {
    match snap.get(
        ColumnFamily::ForwardCodes,
        &storage::doc_field_key(tenant, doc, field),
    ) {
        Some(data) => Ok(Some(decode_record(&data)?)),
        None => Ok(None),
    }
}

/// Read a doc length at the snapshot
pub fn read_doclen(
    snap: &Snapshot,
    tenant: TenantId,
    doc: DocId,
    field: FieldId,
) -> Option<u32> {
    snap.get(
        ColumnFamily::DocLens,
        &storage::doc_field_key(tenant, doc, field),
    )
    .and_then(|v| v.as_slice().try_into().map(u32::from_be_bytes).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use tempfile::tempdir;

    #[test]
    fn test_record_roundtrip() {
        let ids = vec![3u32, 0, 7];
        let codes = vec![0xAB, 0xCD, 0xEF];
        let rec = decode_record(&encode_record(&ids, &codes)).unwrap();
        assert_eq!(rec.centroid_ids, ids);
        assert_eq!(rec.codes, codes);
        assert_eq!(rec.token_code(1, 1), &[0xCD]);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let bytes = encode_record(&[1, 2, 3], &[]);
        assert!(matches!(
            decode_record(&bytes[..7]),
            Err(LateError::Corruption(_))
        ));
    }

    #[test]
    fn test_write_read_clear() {
        let dir = tempdir().unwrap();
        let engine = KvEngine::open(dir.path(), DurabilityLevel::NoSync).unwrap();

        let mut batch = WriteBatch::new();
        write_forward(&mut batch, 1, 42, 0, &[5, 5, 9], &[1, 2, 3]);
        engine.commit(batch).unwrap();

        let snap = engine.snapshot();
        let rec = read_forward(&snap, 1, 42, 0).unwrap().unwrap();
        assert_eq!(rec.token_count(), 3);
        assert_eq!(read_doclen(&snap, 1, 42, 0), Some(3));
        assert!(read_forward(&snap, 1, 43, 0).unwrap().is_none());

        let mut batch = WriteBatch::new();
        clear_forward(&engine, &mut batch, 1, 42).unwrap();
        engine.commit(batch).unwrap();

        let snap = engine.snapshot();
        assert!(read_forward(&snap, 1, 42, 0).unwrap().is_none());
        assert_eq!(read_doclen(&snap, 1, 42, 0), None);
    }
}
