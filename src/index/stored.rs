//! Stored fields: opaque payloads returned with results

use crate::storage::{self, ColumnFamily, KvEngine, Snapshot, WriteBatch};
use crate::types::{DocId, FieldId, FieldValue, TenantId};
use crate::Result;

/// Queue one stored field value
pub fn write_stored(
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
    field: FieldId,
    value: &FieldValue,
) -> Result<()> {
    batch.put(
        ColumnFamily::StoredFields,
        storage::doc_field_key(tenant, doc, field),
        bincode::serialize(value)?,
    );
    Ok(())
}

/// Queue deletion of every stored field of a document
pub fn clear_stored(
    engine: &KvEngine,
    batch: &mut WriteBatch,
    tenant: TenantId,
    doc: DocId,
) -> Result<()> {
    let prefix = storage::doc_prefix(tenant, doc);
    let mut keys = Vec::new();
    engine.scan_prefix_with(ColumnFamily::StoredFields, &prefix, |key, _| {
        keys.push(key.to_vec());
        Ok(())
    })?;
    for key in keys {
        batch.delete(ColumnFamily::StoredFields, key);
    }
    Ok(())
}

/// Read one stored field at the snapshot
pub fn read_stored(
    snap: &Snapshot,
    tenant: TenantId,
    doc: DocId,
    field: FieldId,
) -> Result<Option<FieldValue>> {
    match snap.get(
        ColumnFamily::StoredFields,
        &storage::doc_field_key(tenant, doc, field),
    ) {
        Some(data) => Ok(Some(bincode::deserialize(&data)?)),
        None => Ok(None),
    }
}

/// Walk every document's value of one stored field within a tenant
///
/// This is a linear scan of the tenant; term queries over stored fields
/// use it as their (unindexed) access path.
pub fn scan_field<F>(snap: &Snapshot, tenant: TenantId, field: FieldId, mut f: F) -> Result<()>
where
    F: FnMut(DocId, FieldValue) -> Result<()>,
{
    let prefix = storage::tenant_prefix(tenant);
    snap.scan_prefix_with(ColumnFamily::StoredFields, &prefix, |key, value| {
        if storage::doc_field_key_field(key) == Some(field) {
            if let Some(doc) = storage::doc_field_key_doc(key) {
                f(doc, bincode::deserialize(value)?)?;
            }
        }
        Ok(())
    })
}
