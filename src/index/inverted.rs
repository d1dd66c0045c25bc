//! Inverted index: (tenant, centroid) -> posting list of doc ids
//!
//! Each document contributes one posting per *unique* centroid its
//! tokens landed in, with the token count as payload. A mirror table
//! keyed (tenant, doc, centroid) records the same counts so deletes can
//! unwind a document's postings without decoding its forward record.

use crate::storage::{
    self, ColumnFamily, KvEngine, Snapshot, WriteBatch,
};
use crate::types::{CentroidId, DocId, TenantId};
use crate::Result;
use std::collections::BTreeMap;

/// Queue postings for one document into the caller's batch
pub fn write_postings(
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
    counts: &BTreeMap<CentroidId, u32>,
) {
    for (&centroid, &count) in counts {
        let payload = count.to_be_bytes().to_vec();
        batch.put(
            ColumnFamily::Inverted,
            storage::inverted_key(tenant, centroid, doc),
            payload.clone(),
        );
        batch.put(
            ColumnFamily::InvertedCounts,
            storage::inverted_counts_key(tenant, doc, centroid),
            payload,
        );
    }
}

/// Queue deletion of every posting the document currently holds
///
/// Reads the counts mirror at the latest committed state; the caller
/// holds the writer lock, so that state cannot move underneath us.
pub fn clear_postings(
    engine: &KvEngine,
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
) -> Result<()> {
    let prefix = storage::inverted_counts_prefix(tenant, doc);
    let mut centroids = Vec::new();
    engine.scan_prefix_with(ColumnFamily::InvertedCounts, &prefix, |key, _| {
        if let Some(centroid) = storage::inverted_counts_key_centroid(key) {
            centroids.push(centroid);
        }
        Ok(())
    })?;

    for centroid in centroids {
        batch.delete(
            ColumnFamily::Inverted,
            storage::inverted_key(tenant, centroid, doc),
        );
        batch.delete(
            ColumnFamily::InvertedCounts,
            storage::inverted_counts_key(tenant, doc, centroid),
        );
    }
    Ok(())
}

/// Walk one posting list in ascending doc order
pub fn scan_posting<F>(
    snap: &Snapshot,
    tenant: TenantId,
    centroid: CentroidId,
    mut f: F,
) -> Result<()>
where
    F: FnMut(DocId, u32) -> Result<()>,
{
    let prefix = storage::inverted_prefix(tenant, centroid);
    snap.scan_prefix_with(ColumnFamily::Inverted, &prefix, |key, value| {
        if let Some(doc) = storage::inverted_key_doc(key) {
            let count = value
                .try_into()
                .map(u32::from_be_bytes)
                .unwrap_or(0);
            f(doc, count)?;
        }
        Ok(())
    })
}

/// Unique centroids (with token counts) a document was written under
pub fn doc_centroids(
    snap: &Snapshot,
    tenant: TenantId,
    doc: DocId,
) -> Result<Vec<(CentroidId, u32)>> {
    let prefix = storage::inverted_counts_prefix(tenant, doc);
    let mut out = Vec::new();
    snap.scan_prefix_with(ColumnFamily::InvertedCounts, &prefix, |key, value| {
        if let Some(centroid) = storage::inverted_counts_key_centroid(key) {
            let count = value
                .try_into()
                .map(u32::from_be_bytes)
                .unwrap_or(0);
            out.push((centroid, count));
        }
        Ok(())
    })?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DurabilityLevel;
    use tempfile::tempdir;

    fn counts(pairs: &[(CentroidId, u32)]) -> BTreeMap<CentroidId, u32> {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_postings_roundtrip() {
        let dir = tempdir().unwrap();
        let engine = KvEngine::open(dir.path(), DurabilityLevel::NoSync).unwrap();

        let mut batch = WriteBatch::new();
        write_postings(&mut batch, 0, 10, &counts(&[(1, 3), (5, 2)]));
        write_postings(&mut batch, 0, 7, &counts(&[(1, 1)]));
        engine.commit(batch).unwrap();

        let snap = engine.snapshot();
        let mut docs = Vec::new();
        scan_posting(&snap, 0, 1, |doc, count| {
            docs.push((doc, count));
            Ok(())
        })
        .unwrap();
        // doc order within the posting list
        assert_eq!(docs, vec![(7, 1), (10, 3)]);

        assert_eq!(doc_centroids(&snap, 0, 10).unwrap(), vec![(1, 3), (5, 2)]);
    }

    #[test]
    fn test_clear_removes_both_tables() {
        let dir = tempdir().unwrap();
        let engine = KvEngine::open(dir.path(), DurabilityLevel::NoSync).unwrap();

        let mut batch = WriteBatch::new();
        write_postings(&mut batch, 0, 10, &counts(&[(1, 3), (5, 2)]));
        engine.commit(batch).unwrap();

        let mut batch = WriteBatch::new();
        clear_postings(&engine, &mut batch, 0, 10).unwrap();
        engine.commit(batch).unwrap();

        let snap = engine.snapshot();
        let mut seen = 0;
        scan_posting(&snap, 0, 1, |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 0);
        assert!(doc_centroids(&snap, 0, 10).unwrap().is_empty());
    }

    #[test]
    fn test_tenants_do_not_leak() {
        let dir = tempdir().unwrap();
        let engine = KvEngine::open(dir.path(), DurabilityLevel::NoSync).unwrap();

        let mut batch = WriteBatch::new();
        write_postings(&mut batch, 0, 1, &counts(&[(9, 1)]));
        write_postings(&mut batch, 2, 3, &counts(&[(9, 1)]));
        engine.commit(batch).unwrap();

        let snap = engine.snapshot();
        let mut docs = Vec::new();
        scan_posting(&snap, 0, 9, |doc, _| {
            docs.push(doc);
            Ok(())
        })
        .unwrap();
        assert_eq!(docs, vec![1]);
    }
}
