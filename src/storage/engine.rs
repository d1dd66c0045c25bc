//! Multi-version KV engine with atomic batches and snapshot reads
//!
//! Every committed batch gets one sequence number, so a batch becomes
//! visible atomically or not at all. Readers pin a sequence number
//! (snapshot) and resolve each key to its newest version at or below
//! that pin; versions a live snapshot can still see are never pruned.
//!
//! Durability: WAL frame per commit, checkpoint + WAL truncation on
//! `flush`. Bulk-load mode skips the WAL during explicit build phases;
//! a crash before the closing flush can leave the directory unopenable,
//! which is the documented trade-off for ingest throughput.
//!
//! The engine expects a single writer at a time (the database handle
//! serializes writers); readers are unrestricted.

use super::checkpoint::{self, CfEntries};
use super::wal::Wal;
use super::{BatchOp, ColumnFamily};
use crate::config::DurabilityLevel;
use crate::{LateError, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const MANIFEST_FILE: &str = "MANIFEST.json";
const CHECKPOINT_FILE: &str = "CHECKPOINT";
const WAL_FILE: &str = "wal.log";

/// (sequence, value-or-tombstone), chains kept ascending by sequence
type VersionChain = Vec<(u64, Option<Vec<u8>>)>;
type CfMap = BTreeMap<Vec<u8>, VersionChain>;

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    format: u32,
    last_seq: u64,
}

struct Tables {
    maps: [CfMap; 6],
    last_visible: u64,
}

impl Tables {
    fn empty() -> Self {
        Self {
            maps: Default::default(),
            last_visible: 0,
        }
    }

    fn apply(&mut self, ops: &[BatchOp], seq: u64) {
        for op in ops {
            let (cf, key, value) = match op {
                BatchOp::Put { cf, key, value } => (*cf, key, Some(value.clone())),
                BatchOp::Delete { cf, key } => (*cf, key, None),
            };
            let chain = self.maps[cf.index()].entry(key.clone()).or_default();
            match chain.last_mut() {
                // a batch may touch the same key twice; last write wins
                Some(last) if last.0 == seq => last.1 = value,
                _ => chain.push((seq, value)),
            }
        }
        self.last_visible = seq;
    }

    fn resolve<'a>(chain: &'a VersionChain, seq: u64) -> Option<&'a [u8]> {
        chain
            .iter()
            .rev()
            .find(|(vseq, _)| *vseq <= seq)
            .and_then(|(_, v)| v.as_deref())
    }
}

/// An atomic multi-put / multi-delete batch
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, cf: ColumnFamily, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(BatchOp::Put { cf, key, value });
    }

    pub fn delete(&mut self, cf: ColumnFamily, key: Vec<u8>) {
        self.ops.push(BatchOp::Delete { cf, key });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Column-family KV engine
pub struct KvEngine {
    dir: PathBuf,
    tables: RwLock<Tables>,
    wal: Mutex<Wal>,
    /// seq -> live snapshot count; the smallest key pins old versions
    snapshots: Mutex<BTreeMap<u64, usize>>,
    bulk_load: AtomicBool,
}

impl KvEngine {
    /// Open or create the store under `dir`
    pub fn open(dir: impl AsRef<Path>, durability: DurabilityLevel) -> Result<Arc<Self>> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut tables = Tables::empty();

        let manifest_path = dir.join(MANIFEST_FILE);
        if manifest_path.exists() {
            let raw = fs::read(&manifest_path)?;
            let manifest: Manifest = serde_json::from_slice(&raw)
                .map_err(|e| LateError::Corruption(format!("manifest: {}", e)))?;
            if manifest.format != 1 {
                return Err(LateError::Corruption(format!(
                    "unsupported manifest format {}",
                    manifest.format
                )));
            }

            let checkpoint_path = dir.join(CHECKPOINT_FILE);
            if checkpoint_path.exists() {
                for (cf, entries) in checkpoint::read(&checkpoint_path)? {
                    let map = &mut tables.maps[cf.index()];
                    for (key, value) in entries {
                        map.insert(key, vec![(manifest.last_seq, Some(value))]);
                    }
                }
            }
            tables.last_visible = manifest.last_seq;
        }

        let (wal, batches) = Wal::open(dir.join(WAL_FILE), durability)?;
        for ops in batches {
            let seq = tables.last_visible + 1;
            tables.apply(&ops, seq);
        }

        Ok(Arc::new(Self {
            dir,
            tables: RwLock::new(tables),
            wal: Mutex::new(wal),
            snapshots: Mutex::new(BTreeMap::new()),
            bulk_load: AtomicBool::new(false),
        }))
    }

    /// Commit a batch: WAL first, then apply under one sequence number
    ///
    /// Lock order is tables before wal, matching `flush`.
    pub fn commit(&self, batch: WriteBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.write();
        if !self.bulk_load.load(Ordering::Acquire) {
            // a failed append leaves memory untouched
            self.wal.lock().append(&batch.ops)?;
        }
        let seq = tables.last_visible + 1;
        tables.apply(&batch.ops, seq);
        Ok(())
    }

    /// Point read at the latest committed state
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        let tables = self.tables.read();
        let seq = tables.last_visible;
        tables.maps[cf.index()]
            .get(key)
            .and_then(|chain| Tables::resolve(chain, seq))
            .map(|v| v.to_vec())
    }

    /// Ordered prefix scan at the latest committed state, zero-copy
    pub fn scan_prefix_with<F>(&self, cf: ColumnFamily, prefix: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let tables = self.tables.read();
        let seq = tables.last_visible;
        Self::scan_inner(&tables, cf, prefix, seq, f)
    }

    fn scan_inner<F>(
        tables: &Tables,
        cf: ColumnFamily,
        prefix: &[u8],
        seq: u64,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let map = &tables.maps[cf.index()];
        let upper = prefix_end(prefix);
        let range: Box<dyn Iterator<Item = (&Vec<u8>, &VersionChain)>> = match &upper {
            Some(end) => Box::new(map.range::<[u8], _>((
                Bound::Included(prefix),
                Bound::Excluded(end.as_slice()),
            ))),
            None => Box::new(
                map.range::<[u8], _>((Bound::Included(prefix), Bound::Unbounded)),
            ),
        };
        for (key, chain) in range {
            if let Some(value) = Tables::resolve(chain, seq) {
                f(key, value)?;
            }
        }
        Ok(())
    }

    /// Pin the current state for consistent reads
    pub fn snapshot(self: &Arc<Self>) -> Snapshot {
        let seq = self.tables.read().last_visible;
        *self.snapshots.lock().entry(seq).or_insert(0) += 1;
        Snapshot {
            engine: Arc::clone(self),
            seq,
        }
    }

    /// Checkpoint the latest state and truncate the WAL
    pub fn flush(&self) -> Result<()> {
        let mut tables = self.tables.write();

        let mut families: Vec<(ColumnFamily, CfEntries)> = Vec::with_capacity(6);
        let seq = tables.last_visible;
        for cf in ColumnFamily::ALL {
            let entries: CfEntries = tables.maps[cf.index()]
                .iter()
                .filter_map(|(k, chain)| {
                    Tables::resolve(chain, seq).map(|v| (k.clone(), v.to_vec()))
                })
                .collect();
            families.push((cf, entries));
        }
        checkpoint::write(&self.dir.join(CHECKPOINT_FILE), &families)?;

        let manifest = Manifest {
            format: 1,
            last_seq: seq,
        };
        let tmp = self.dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(
            &tmp,
            serde_json::to_vec_pretty(&manifest)
                .map_err(|e| LateError::Serialization(e.to_string()))?,
        )?;
        fs::rename(&tmp, self.dir.join(MANIFEST_FILE))?;

        self.wal.lock().reset()?;
        self.prune(&mut tables);
        Ok(())
    }

    /// Drop versions no live snapshot can observe
    fn prune(&self, tables: &mut Tables) {
        let min_pin = self
            .snapshots
            .lock()
            .keys()
            .next()
            .copied()
            .unwrap_or(tables.last_visible)
            .min(tables.last_visible);

        for map in tables.maps.iter_mut() {
            map.retain(|_, chain| {
                if let Some(keep) = chain
                    .iter()
                    .rposition(|(vseq, _)| *vseq <= min_pin)
                {
                    chain.drain(..keep);
                }
                // a key whose only surviving version is a tombstone
                // visible to everyone can disappear entirely
                !(chain.len() == 1 && chain[0].1.is_none() && chain[0].0 <= min_pin)
            });
        }
    }

    /// Toggle bulk-load mode (skip the WAL). Callers must `flush` when
    /// turning it off; a crash before that flush loses the loaded data.
    pub fn set_bulk_load(&self, on: bool) {
        self.bulk_load.store(on, Ordering::Release);
        tracing::debug!(bulk_load = on, "storage bulk-load mode");
    }

    /// Flush, then link or copy the storage files into `dst`
    pub fn checkpoint_to(&self, dst: impl AsRef<Path>) -> Result<()> {
        self.flush()?;
        let dst = dst.as_ref();
        fs::create_dir_all(dst)?;
        for name in [CHECKPOINT_FILE, MANIFEST_FILE] {
            let src = self.dir.join(name);
            if src.exists() {
                checkpoint::link_or_copy(&src, &dst.join(name))?;
            }
        }
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn release_snapshot(&self, seq: u64) {
        let mut snaps = self.snapshots.lock();
        if let Some(count) = snaps.get_mut(&seq) {
            *count -= 1;
            if *count == 0 {
                snaps.remove(&seq);
            }
        }
    }
}

/// A consistent read view pinned at one sequence number
pub struct Snapshot {
    engine: Arc<KvEngine>,
    seq: u64,
}

impl Snapshot {
    pub fn get(&self, cf: ColumnFamily, key: &[u8]) -> Option<Vec<u8>> {
        let tables = self.engine.tables.read();
        tables.maps[cf.index()]
            .get(key)
            .and_then(|chain| Tables::resolve(chain, self.seq))
            .map(|v| v.to_vec())
    }

    /// Ordered prefix scan at the pinned state, zero-copy callback
    pub fn scan_prefix_with<F>(&self, cf: ColumnFamily, prefix: &[u8], f: F) -> Result<()>
    where
        F: FnMut(&[u8], &[u8]) -> Result<()>,
    {
        let tables = self.engine.tables.read();
        KvEngine::scan_inner(&tables, cf, prefix, self.seq, f)
    }

    /// Prefix scan collected into a vector
    pub fn scan_prefix(&self, cf: ColumnFamily, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        self.scan_prefix_with(cf, prefix, |k, v| {
            out.push((k.to_vec(), v.to_vec()));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl Drop for Snapshot {
    fn drop(&mut self) {
        self.engine.release_snapshot(self.seq);
    }
}

/// Smallest byte string strictly greater than every key with `prefix`
fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xFF {
            *last += 1;
            return Some(end);
        }
        end.pop();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine(dir: &Path) -> Arc<KvEngine> {
        KvEngine::open(dir, DurabilityLevel::NoSync).unwrap()
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempdir().unwrap();
        let db = engine(dir.path());

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"v".to_vec());
        db.commit(batch).unwrap();
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), Some(b"v".to_vec()));

        let mut batch = WriteBatch::new();
        batch.delete(ColumnFamily::Meta, b"k".to_vec());
        db.commit(batch).unwrap();
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), None);
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let db = engine(dir.path());

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"old".to_vec());
        db.commit(batch).unwrap();

        let snap = db.snapshot();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"new".to_vec());
        batch.put(ColumnFamily::Meta, b"k2".to_vec(), b"x".to_vec());
        db.commit(batch).unwrap();

        // the snapshot still sees the pre-commit state
        assert_eq!(snap.get(ColumnFamily::Meta, b"k"), Some(b"old".to_vec()));
        assert_eq!(snap.get(ColumnFamily::Meta, b"k2"), None);
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_snapshot_survives_flush() {
        let dir = tempdir().unwrap();
        let db = engine(dir.path());

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"old".to_vec());
        db.commit(batch).unwrap();

        let snap = db.snapshot();

        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"new".to_vec());
        db.commit(batch).unwrap();

        db.flush().unwrap();
        assert_eq!(snap.get(ColumnFamily::Meta, b"k"), Some(b"old".to_vec()));

        drop(snap);
        db.flush().unwrap();
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), Some(b"new".to_vec()));
    }

    #[test]
    fn test_prefix_scan_ordered() {
        let dir = tempdir().unwrap();
        let db = engine(dir.path());

        let mut batch = WriteBatch::new();
        for doc in [300u64, 9, 17] {
            batch.put(
                ColumnFamily::Inverted,
                crate::storage::inverted_key(1, 5, doc),
                vec![],
            );
        }
        batch.put(
            ColumnFamily::Inverted,
            crate::storage::inverted_key(1, 6, 1),
            vec![],
        );
        db.commit(batch).unwrap();

        let snap = db.snapshot();
        let mut docs = Vec::new();
        snap.scan_prefix_with(
            ColumnFamily::Inverted,
            &crate::storage::inverted_prefix(1, 5),
            |k, _| {
                docs.push(crate::storage::inverted_key_doc(k).unwrap());
                Ok(())
            },
        )
        .unwrap();
        assert_eq!(docs, vec![9, 17, 300]);
    }

    #[test]
    fn test_wal_replay_on_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = engine(dir.path());
            let mut batch = WriteBatch::new();
            batch.put(ColumnFamily::Meta, b"k".to_vec(), b"v".to_vec());
            db.commit(batch).unwrap();
            // no flush: reopen must replay from the WAL
        }
        let db = engine(dir.path());
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), Some(b"v".to_vec()));
    }

    #[test]
    fn test_checkpoint_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = engine(dir.path());
            let mut batch = WriteBatch::new();
            batch.put(ColumnFamily::Meta, b"k".to_vec(), b"v".to_vec());
            db.commit(batch).unwrap();
            db.flush().unwrap();

            let mut batch = WriteBatch::new();
            batch.put(ColumnFamily::Meta, b"k2".to_vec(), b"v2".to_vec());
            db.commit(batch).unwrap();
        }
        let db = engine(dir.path());
        assert_eq!(db.get(ColumnFamily::Meta, b"k"), Some(b"v".to_vec()));
        assert_eq!(db.get(ColumnFamily::Meta, b"k2"), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_bulk_load_skips_wal() {
        let dir = tempdir().unwrap();
        {
            let db = engine(dir.path());
            db.set_bulk_load(true);
            let mut batch = WriteBatch::new();
            batch.put(ColumnFamily::Meta, b"lost".to_vec(), b"x".to_vec());
            db.commit(batch).unwrap();
            // dropped without flush
        }
        let db = engine(dir.path());
        assert_eq!(db.get(ColumnFamily::Meta, b"lost"), None);

        db.set_bulk_load(true);
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"kept".to_vec(), b"x".to_vec());
        db.commit(batch).unwrap();
        db.set_bulk_load(false);
        db.flush().unwrap();

        let db2 = engine(dir.path());
        assert_eq!(db2.get(ColumnFamily::Meta, b"kept"), Some(b"x".to_vec()));
    }

    #[test]
    fn test_checkpoint_to_copies_state() {
        let src_dir = tempdir().unwrap();
        let dst_dir = tempdir().unwrap();
        let dst = dst_dir.path().join("copy");

        let db = engine(src_dir.path());
        let mut batch = WriteBatch::new();
        batch.put(ColumnFamily::Meta, b"k".to_vec(), b"v".to_vec());
        db.commit(batch).unwrap();
        db.checkpoint_to(&dst).unwrap();

        let copy = engine(&dst);
        assert_eq!(copy.get(ColumnFamily::Meta, b"k"), Some(b"v".to_vec()));
    }
}
