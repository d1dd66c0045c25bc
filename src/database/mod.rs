//! LateDB: the embedded late-interaction index handle
//!
//! Owns the storage engine, the schema and the trained tables, and
//! exposes the library surface: create / open / train / add / remove /
//! update / search / merge / snapshot / save.
//!
//! ## Concurrency
//! Single-writer, many-reader. Every mutating operation holds the
//! engine-wide writer mutex for its full duration; searches pin a
//! storage snapshot at entry and never block writers. Trained tables
//! are immutable after training and shared by reference.

use crate::config::IndexConfig;
use crate::index::{stored, CoarseQuantizer, FieldIndex, TrainedState};
use crate::query::{self, Query};
use crate::quantizer::ResidualCodec;
use crate::retriever::{CancelFn, SearchOptions};
use crate::schema::Schema;
use crate::storage::{self, ColumnFamily, KvEngine, WriteBatch};
use crate::types::{DocId, Document, FieldId, FieldValue, TenantId};
use crate::writer::Writer;
use crate::{LateError, Result};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk format version (major, minor, revision). Open rejects a
/// strictly greater major.
pub const FORMAT_VERSION: (u32, u32, u32) = (1, 0, 0);

const META_SCHEMA: &str = "schema";
const META_VERSION: &str = "version";

fn centroids_key(field: FieldId) -> String {
    format!("centroids/{}", field)
}

fn codec_key(field: FieldId) -> String {
    format!("codec/{}", field)
}

/// One hydrated search hit
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub doc_id: DocId,
    pub score: f32,
    /// Stored-role fields of the document, in schema order
    pub fields: Vec<(String, FieldValue)>,
}

/// Per-tenant size summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexStats {
    pub documents: u64,
    pub tokens: u64,
}

/// Embedded late-interaction retrieval index
pub struct LateDB {
    path: PathBuf,
    engine: Arc<KvEngine>,
    schema: Arc<Schema>,
    config: IndexConfig,
    trained: RwLock<Arc<TrainedState>>,
    /// Serializes add / remove / update / train / merge / snapshot
    writer_lock: Mutex<()>,
}

impl LateDB {
    /// Create a new index; fails if `path` already exists
    pub fn create(path: impl AsRef<Path>, schema: Schema, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(LateError::InvalidArgument(format!(
                "path already exists: {}",
                path.display()
            )));
        }
        let engine = KvEngine::open(&path, config.durability)?;

        let mut batch = WriteBatch::new();
        batch.put(
            ColumnFamily::Meta,
            storage::meta_key(META_SCHEMA),
            schema.to_bytes(),
        );
        batch.put(
            ColumnFamily::Meta,
            storage::meta_key(META_VERSION),
            encode_version(FORMAT_VERSION),
        );
        engine.commit(batch)?;
        engine.flush()?;
        tracing::info!(path = %path.display(), fields = schema.len(), "created index");

        Ok(Self {
            path,
            engine,
            schema: Arc::new(schema),
            config,
            trained: RwLock::new(Arc::new(TrainedState::default())),
            writer_lock: Mutex::new(()),
        })
    }

    /// Open an existing index with the default configuration
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(path, IndexConfig::default())
    }

    /// Open an existing index
    pub fn open_with_config(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(LateError::InvalidArgument(format!(
                "no index at {}",
                path.display()
            )));
        }
        let engine = KvEngine::open(&path, config.durability)?;

        let version_blob = engine
            .get(ColumnFamily::Meta, &storage::meta_key(META_VERSION))
            .ok_or_else(|| LateError::Corruption("missing version record".into()))?;
        let found = decode_version(&version_blob)?;
        if found.0 > FORMAT_VERSION.0 {
            return Err(LateError::VersionTooNew {
                found: format!("{}.{}.{}", found.0, found.1, found.2),
                supported: format!(
                    "{}.{}.{}",
                    FORMAT_VERSION.0, FORMAT_VERSION.1, FORMAT_VERSION.2
                ),
            });
        }

        let schema_blob = engine
            .get(ColumnFamily::Meta, &storage::meta_key(META_SCHEMA))
            .ok_or_else(|| LateError::Corruption("missing schema record".into()))?;
        let schema = Schema::from_bytes(&schema_blob)?;

        let mut fields = AHashMap::default();
        for field_id in schema.indexed_tensor_fields() {
            let coarse_blob =
                engine.get(ColumnFamily::Meta, &storage::meta_key(&centroids_key(field_id)));
            let codec_blob =
                engine.get(ColumnFamily::Meta, &storage::meta_key(&codec_key(field_id)));
            if let (Some(cb), Some(qb)) = (coarse_blob, codec_blob) {
                fields.insert(
                    field_id,
                    FieldIndex {
                        coarse: CoarseQuantizer::from_bytes(&cb)?,
                        codec: ResidualCodec::from_bytes(&qb)?,
                    },
                );
            }
        }
        tracing::info!(
            path = %path.display(),
            trained = !fields.is_empty(),
            "opened index"
        );

        Ok(Self {
            path,
            engine,
            schema: Arc::new(schema),
            config,
            trained: RwLock::new(Arc::new(TrainedState { fields })),
            writer_lock: Mutex::new(()),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_trained(&self) -> bool {
        !self.trained.read().is_empty()
    }

    /// One-shot training over sample documents; callable only once
    pub fn train(&self, docs: &[Document]) -> Result<()> {
        let _guard = self.writer_lock.lock();
        if self.is_trained() {
            return Err(LateError::InvalidArgument(
                "index is already trained".into(),
            ));
        }

        let mut fields = AHashMap::default();
        for field_id in self.schema.indexed_tensor_fields() {
            let field = self.schema.field_by_id(field_id).unwrap();
            let dim = field.params.dimensions as usize;

            let mut sample = Vec::new();
            for doc in docs {
                if let Some(FieldValue::Tensor(tensor)) = doc.field(&field.name) {
                    if tensor.dim() != dim {
                        return Err(LateError::DimensionMismatch {
                            expected: dim,
                            got: tensor.dim(),
                        });
                    }
                    sample.extend_from_slice(tensor.normalized().as_slice());
                }
            }
            if sample.is_empty() {
                return Err(LateError::InvalidTraining(format!(
                    "no sample tensors for field '{}'",
                    field.name
                )));
            }

            let coarse = CoarseQuantizer::train(
                &sample,
                dim,
                field.params.num_centroids as usize,
                field.params.num_iterations as usize,
                self.config.seed,
            )?;
            let codec = train_codec_on_residuals(&coarse, field, &sample, self.config.seed)?;
            tracing::info!(
                field = %field.name,
                rows = sample.len() / dim,
                centroids = coarse.num_centroids(),
                "trained field"
            );
            fields.insert(field_id, FieldIndex { coarse, codec });
        }

        let state = Arc::new(TrainedState { fields });
        self.persist_tables(&state)?;
        *self.trained.write() = state;
        Ok(())
    }

    /// Adopt an externally trained codebook for one field. The residual
    /// codec is still trained here, on residuals of `sample` against
    /// the imported centroids; equivalent to `train` + `save`.
    pub fn import_centroids(
        &self,
        field_name: &str,
        centroids: Vec<f32>,
        sample: &[Document],
    ) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let (field_id, field) = self
            .schema
            .field(field_name)
            .ok_or_else(|| LateError::UnknownField(field_name.to_string()))?;
        if !field.is_indexed_tensor() {
            return Err(LateError::InvalidSchema(format!(
                "field '{}' is not an indexed tensor field",
                field_name
            )));
        }
        if self.trained.read().field(field_id).is_some() {
            return Err(LateError::InvalidArgument(format!(
                "field '{}' is already trained",
                field_name
            )));
        }

        let dim = field.params.dimensions as usize;
        let coarse = CoarseQuantizer::from_centroids(centroids, dim)?;

        let mut rows = Vec::new();
        for doc in sample {
            if let Some(FieldValue::Tensor(tensor)) = doc.field(field_name) {
                rows.extend_from_slice(tensor.normalized().as_slice());
            }
        }
        if rows.is_empty() {
            return Err(LateError::InvalidTraining(format!(
                "no sample tensors for field '{}'",
                field_name
            )));
        }
        let codec = train_codec_on_residuals(&coarse, field, &rows, self.config.seed)?;

        let mut fields = self.trained.read().fields.clone();
        fields.insert(field_id, FieldIndex { coarse, codec });
        let state = Arc::new(TrainedState { fields });
        self.persist_tables(&state)?;
        *self.trained.write() = state;
        Ok(())
    }

    /// Re-persist codec and centroid tables to the meta family
    pub fn save(&self) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let state = self.trained.read().clone();
        self.persist_tables(&state)
    }

    fn persist_tables(&self, state: &TrainedState) -> Result<()> {
        let mut batch = WriteBatch::new();
        for (&field_id, tables) in &state.fields {
            batch.put(
                ColumnFamily::Meta,
                storage::meta_key(&centroids_key(field_id)),
                tables.coarse.to_bytes(),
            );
            batch.put(
                ColumnFamily::Meta,
                storage::meta_key(&codec_key(field_id)),
                tables.codec.to_bytes(),
            );
        }
        self.engine.commit(batch)?;
        self.engine.flush()
    }

    /// Atomic upsert of documents into a tenant
    pub fn add(&self, tenant: TenantId, docs: &[Document]) -> Result<()> {
        let _guard = self.writer_lock.lock();
        if !self.is_trained() {
            return Err(LateError::IndexUntrained);
        }
        let trained = self.trained.read().clone();
        Writer::new(&self.engine, &self.schema, &trained).add(tenant, docs)
    }

    /// Atomic delete of documents from a tenant
    pub fn remove(&self, tenant: TenantId, ids: &[DocId]) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let trained = self.trained.read().clone();
        Writer::new(&self.engine, &self.schema, &trained).remove(tenant, ids)
    }

    /// Replace documents; identical to re-`add` with the same ids
    pub fn update(&self, tenant: TenantId, docs: &[Document]) -> Result<()> {
        self.add(tenant, docs)
    }

    /// Execute a query and hydrate stored fields for the winners
    pub fn search(
        &self,
        tenant: TenantId,
        query: &Query,
        k: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        self.search_with_cancel(tenant, query, k, opts, None)
    }

    /// `search` with a cooperative cancel predicate, checked between
    /// retrieval stages
    pub fn search_with_cancel(
        &self,
        tenant: TenantId,
        query: &Query,
        k: usize,
        opts: &SearchOptions,
        cancel: Option<&CancelFn>,
    ) -> Result<Vec<SearchResult>> {
        let snap = self.engine.snapshot();
        let trained = self.trained.read().clone();

        let scores = query::execute_node(
            &snap,
            &self.schema,
            &trained,
            tenant,
            &query.root,
            k,
            opts,
            cancel,
        )?;
        let ranked = query::rank(scores, k);

        // stage 4: hydration
        let mut results = Vec::with_capacity(ranked.len());
        for (doc_id, score) in ranked {
            let mut fields = Vec::new();
            for (i, field) in self.schema.fields().iter().enumerate() {
                if field.is_stored() {
                    if let Some(value) =
                        stored::read_stored(&snap, tenant, doc_id, i as FieldId)?
                    {
                        fields.push((field.name.clone(), value));
                    }
                }
            }
            results.push(SearchResult {
                doc_id,
                score,
                fields,
            });
        }
        Ok(results)
    }

    /// Copy every document of a compatible index into this one
    ///
    /// Precondition: identical schema and identical trained tables; the
    /// merged indexes must share a codebook.
    pub fn merge(&self, other_path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.writer_lock.lock();
        let other = LateDB::open_with_config(other_path, IndexConfig::no_sync())?;

        if other.schema.to_bytes() != self.schema.to_bytes() {
            return Err(LateError::MergeIncompatible("schemas differ".into()));
        }
        let mine = self.trained.read().clone();
        let theirs = other.trained.read().clone();
        for field_id in self.schema.indexed_tensor_fields() {
            let field = self.schema.field_by_id(field_id).unwrap();
            match (mine.field(field_id), theirs.field(field_id)) {
                (Some(a), Some(b)) => {
                    if a.coarse.to_bytes() != b.coarse.to_bytes() {
                        return Err(LateError::MergeIncompatible(format!(
                            "centroid tables differ for field '{}'",
                            field.name
                        )));
                    }
                    if a.codec.to_bytes() != b.codec.to_bytes() {
                        return Err(LateError::MergeIncompatible(format!(
                            "codec tables differ for field '{}'",
                            field.name
                        )));
                    }
                }
                (None, None) => {}
                _ => {
                    return Err(LateError::MergeIncompatible(format!(
                        "training state differs for field '{}'",
                        field.name
                    )))
                }
            }
        }

        let snap = other.engine.snapshot();
        let mut batch = WriteBatch::new();
        for cf in ColumnFamily::ALL {
            if cf == ColumnFamily::Meta {
                continue;
            }
            snap.scan_prefix_with(cf, &[], |key, value| {
                batch.put(cf, key.to_vec(), value.to_vec());
                Ok(())
            })?;
        }
        tracing::info!(
            from = %other.path.display(),
            ops = batch.len(),
            "merging index"
        );
        self.engine.commit(batch)
    }

    /// Checkpoint the index into `path` (link-based copy where the
    /// filesystem supports it)
    pub fn snapshot(&self, path: impl AsRef<Path>) -> Result<()> {
        let _guard = self.writer_lock.lock();
        self.engine.checkpoint_to(path)
    }

    /// Toggle bulk-load ingest: WAL is bypassed while on; turning it
    /// off flushes so the loaded data becomes durable
    pub fn set_bulk_load(&self, on: bool) -> Result<()> {
        let _guard = self.writer_lock.lock();
        self.engine.set_bulk_load(on);
        if !on {
            self.engine.flush()?;
        }
        Ok(())
    }

    /// Document and token totals for one tenant
    pub fn stats(&self, tenant: TenantId) -> Result<IndexStats> {
        let snap = self.engine.snapshot();
        let prefix = storage::tenant_prefix(tenant);
        let mut documents = 0u64;
        let mut tokens = 0u64;
        let mut last_doc = None;
        snap.scan_prefix_with(ColumnFamily::DocLens, &prefix, |key, value| {
            let doc = storage::doc_field_key_doc(key);
            if doc != last_doc {
                documents += 1;
                last_doc = doc;
            }
            if let Ok(bytes) = <[u8; 4]>::try_from(value) {
                tokens += u32::from_be_bytes(bytes) as u64;
            }
            Ok(())
        })?;
        Ok(IndexStats { documents, tokens })
    }
}

impl Drop for LateDB {
    fn drop(&mut self) {
        // best effort: make the final state durable on all exit paths
        if let Err(e) = self.engine.flush() {
            tracing::warn!(error = %e, "flush on close failed");
        }
    }
}

/// Encode residuals of the (already normalized) sample rows and train
/// the field's codec on them
fn train_codec_on_residuals(
    coarse: &CoarseQuantizer,
    field: &crate::schema::Field,
    rows: &[f32],
    seed: u64,
) -> Result<ResidualCodec> {
    let dim = field.params.dimensions as usize;
    let mut residuals = vec![0.0f32; rows.len()];
    for (i, row) in rows.chunks_exact(dim).enumerate() {
        let centroid = coarse.centroid(coarse.assign(row)?);
        let out = &mut residuals[i * dim..(i + 1) * dim];
        for ((o, &x), &c) in out.iter_mut().zip(row).zip(centroid) {
            *o = x - c;
        }
    }
    ResidualCodec::train(&field.params, &residuals, seed)
}

fn encode_version(v: (u32, u32, u32)) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    buf.extend_from_slice(&v.0.to_be_bytes());
    buf.extend_from_slice(&v.1.to_be_bytes());
    buf.extend_from_slice(&v.2.to_be_bytes());
    buf
}

fn decode_version(data: &[u8]) -> Result<(u32, u32, u32)> {
    if data.len() != 12 {
        return Err(LateError::Corruption("bad version record".into()));
    }
    let part = |i: usize| u32::from_be_bytes(data[i * 4..(i + 1) * 4].try_into().unwrap());
    Ok((part(0), part(1), part(2)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{forward, inverted};
    use crate::query::QueryNode;
    use crate::schema::{role, DataType, Field, FieldParameters, QuantizerType};
    use crate::types::Tensor;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::tempdir;

    const DIM: usize = 128;

    fn binarizer_schema(num_centroids: u32, nbits: u8) -> Schema {
        Schema::new(vec![
            Field::new(
                "colbert",
                DataType::Tensor,
                role::INDEXED,
                FieldParameters {
                    dimensions: DIM as u32,
                    quantization: QuantizerType::Binarizer,
                    num_centroids,
                    num_iterations: 4,
                    nbits,
                    ..Default::default()
                },
            ),
            Field::stored("title", DataType::Text),
        ])
        .unwrap()
    }

    fn pq_schema(num_centroids: u32, m: u8, nbits: u8) -> Schema {
        Schema::new(vec![Field::new(
            "colbert",
            DataType::Tensor,
            role::INDEXED,
            FieldParameters {
                dimensions: DIM as u32,
                quantization: QuantizerType::ProductEncoder,
                num_centroids,
                num_iterations: 4,
                num_subquantizers: m,
                nbits,
                ..Default::default()
            },
        )])
        .unwrap()
    }

    fn constant_tensor(rows: usize, value: f32) -> Tensor {
        Tensor::new(vec![value; rows * DIM], DIM).unwrap()
    }

    fn random_tensor(rng: &mut StdRng, rows: usize) -> Tensor {
        let data: Vec<f32> = (0..rows * DIM).map(|_| rng.gen::<f32>()).collect();
        Tensor::new(data, DIM).unwrap()
    }

    /// S1 fixture: constants for training and documents
    fn train_docs_constants() -> Vec<Document> {
        (0..5)
            .map(|i| {
                Document::new(i as DocId).with_field(
                    "colbert",
                    FieldValue::Tensor(constant_tensor(300, i as f32 / 10.0)),
                )
            })
            .collect()
    }

    fn setup_s1(dir: &Path) -> LateDB {
        let db = LateDB::create(
            dir.join("index"),
            binarizer_schema(5, 1),
            IndexConfig::no_sync(),
        )
        .unwrap();
        db.train(&train_docs_constants()).unwrap();

        let docs: Vec<Document> = (0..10)
            .map(|i| {
                Document::new(i as DocId)
                    .with_field(
                        "colbert",
                        FieldValue::Tensor(constant_tensor(100, i as f32)),
                    )
                    .with_field("title", FieldValue::Text(format!("doc {}", i)))
            })
            .collect();
        db.add(0, &docs).unwrap();
        db
    }

    fn ones_query() -> Query {
        Query::new(QueryNode::vector("colbert", constant_tensor(100, 1.0)))
    }

    #[test]
    fn test_s1_train_add_search_constants() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        let results = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(results.len(), 10);
        assert_eq!(results[0].doc_id, 1);
        // docs 0 and 2 land right behind the exact match
        let pos0 = results.iter().position(|r| r.doc_id == 0).unwrap();
        assert!((1..=2).contains(&pos0), "doc 0 at position {}", pos0 + 1);
        let pos2 = results.iter().position(|r| r.doc_id == 2).unwrap();
        assert!((1..=2).contains(&pos2), "doc 2 at position {}", pos2 + 1);
        // hydration returns the stored title
        assert_eq!(
            results[0].fields,
            vec![("title".to_string(), FieldValue::Text("doc 1".into()))]
        );
    }

    #[test]
    fn test_s2_delete_visibility() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        db.remove(0, &[1]).unwrap();
        let results = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|r| r.doc_id != 1));
    }

    #[test]
    fn test_s3_multi_tenant_pq() {
        let dir = tempdir().unwrap();
        let db = LateDB::create(
            dir.path().join("index"),
            pq_schema(32, 16, 2),
            IndexConfig::no_sync(),
        )
        .unwrap();

        let mut rng = StdRng::seed_from_u64(99);
        let sample = random_tensor(&mut rng, 1500);
        db.train(&[Document::new(0).with_field("colbert", FieldValue::Tensor(sample))])
            .unwrap();

        let tensor = random_tensor(&mut rng, 30);
        db.add(
            0,
            &[Document::new(1).with_field("colbert", FieldValue::Tensor(tensor.clone()))],
        )
        .unwrap();
        db.add(
            2,
            &[Document::new(3).with_field("colbert", FieldValue::Tensor(tensor.clone()))],
        )
        .unwrap();

        let query = Query::new(QueryNode::vector("colbert", tensor));
        let opts = SearchOptions {
            centroid_score_threshold: 0.0,
            ..Default::default()
        };

        let at0 = db.search(0, &query, 10, &opts).unwrap();
        assert_eq!(at0.len(), 1);
        assert_eq!(at0[0].doc_id, 1);

        let at2 = db.search(2, &query, 10, &opts).unwrap();
        assert_eq!(at2.len(), 1);
        assert_eq!(at2[0].doc_id, 3);
    }

    #[test]
    fn test_s4_merge() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");

        // deterministic training: same sample + same seed = same tables
        let a = LateDB::create(&path_a, binarizer_schema(5, 1), IndexConfig::no_sync()).unwrap();
        let b = LateDB::create(&path_b, binarizer_schema(5, 1), IndexConfig::no_sync()).unwrap();
        a.train(&train_docs_constants()).unwrap();
        b.train(&train_docs_constants()).unwrap();

        a.add(
            0,
            &[Document::new(1).with_field(
                "colbert",
                FieldValue::Tensor(constant_tensor(30, 1.0)),
            )],
        )
        .unwrap();
        b.add(
            0,
            &[Document::new(2).with_field(
                "colbert",
                FieldValue::Tensor(constant_tensor(30, 2.0)),
            )],
        )
        .unwrap();
        drop(b);

        a.merge(&path_b).unwrap();
        let results = a
            .search(
                0,
                &Query::new(QueryNode::vector("colbert", constant_tensor(30, 1.0))),
                10,
                &SearchOptions::default(),
            )
            .unwrap();
        let ids: Vec<DocId> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&1) && ids.contains(&2));
    }

    #[test]
    fn test_s4_merge_rejects_different_codebooks() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");

        let a = LateDB::create(&path_a, binarizer_schema(5, 1), IndexConfig::no_sync()).unwrap();
        let b = LateDB::create(
            &path_b,
            binarizer_schema(5, 1),
            IndexConfig {
                seed: 777,
                ..IndexConfig::no_sync()
            },
        )
        .unwrap();
        a.train(&train_docs_constants()).unwrap();

        // different seed over different sample: different centroids
        let mut rng = StdRng::seed_from_u64(5);
        b.train(&[Document::new(0)
            .with_field("colbert", FieldValue::Tensor(random_tensor(&mut rng, 400)))])
            .unwrap();
        drop(b);

        assert!(matches!(
            a.merge(&path_b),
            Err(LateError::MergeIncompatible(_))
        ));
    }

    #[test]
    fn test_s5_reopen_returns_identical_results() {
        let dir = tempdir().unwrap();
        let before;
        {
            let db = setup_s1(dir.path());
            before = db
                .search(0, &ones_query(), 10, &SearchOptions::default())
                .unwrap();
        }

        let db = LateDB::open(dir.path().join("index")).unwrap();
        assert!(db.is_trained());
        let after = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_s6_version_gate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let db = LateDB::create(&path, binarizer_schema(5, 1), IndexConfig::no_sync())
                .unwrap();
            drop(db);
        }
        // overwrite the version record with a future major
        {
            let engine =
                KvEngine::open(&path, crate::config::DurabilityLevel::NoSync).unwrap();
            let mut batch = WriteBatch::new();
            batch.put(
                ColumnFamily::Meta,
                storage::meta_key(META_VERSION),
                encode_version((2, 0, 0)),
            );
            engine.commit(batch).unwrap();
            engine.flush().unwrap();
        }

        assert!(matches!(
            LateDB::open(&path),
            Err(LateError::VersionTooNew { .. })
        ));
    }

    #[test]
    fn test_create_fails_on_existing_path() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            LateDB::create(
                dir.path(),
                binarizer_schema(5, 1),
                IndexConfig::no_sync()
            ),
            Err(LateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_add_before_train_rejected() {
        let dir = tempdir().unwrap();
        let db = LateDB::create(
            dir.path().join("index"),
            binarizer_schema(5, 1),
            IndexConfig::no_sync(),
        )
        .unwrap();
        let doc =
            Document::new(1).with_field("colbert", FieldValue::Tensor(constant_tensor(3, 1.0)));
        assert!(matches!(db.add(0, &[doc]), Err(LateError::IndexUntrained)));
    }

    #[test]
    fn test_train_twice_rejected() {
        let dir = tempdir().unwrap();
        let db = LateDB::create(
            dir.path().join("index"),
            binarizer_schema(5, 1),
            IndexConfig::no_sync(),
        )
        .unwrap();
        db.train(&train_docs_constants()).unwrap();
        assert!(db.train(&train_docs_constants()).is_err());
    }

    #[test]
    fn test_tenant_isolation_property() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        // tenant 7 sees nothing from tenant 0
        let results = db
            .search(7, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert!(results.is_empty());

        db.add(
            7,
            &[Document::new(100).with_field(
                "colbert",
                FieldValue::Tensor(constant_tensor(10, 1.0)),
            )],
        )
        .unwrap();
        let results = db
            .search(7, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, 100);
    }

    #[test]
    fn test_posting_consistency_property() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        let snap = db.engine.snapshot();
        for doc in 0..10u64 {
            let record = forward::read_forward(&snap, 0, doc, 0).unwrap().unwrap();
            let mut from_forward: Vec<u32> = record.centroid_ids.clone();
            from_forward.sort_unstable();
            from_forward.dedup();

            let from_postings: Vec<u32> = inverted::doc_centroids(&snap, 0, doc)
                .unwrap()
                .into_iter()
                .map(|(c, _)| c)
                .collect();
            assert_eq!(from_forward, from_postings, "doc {}", doc);

            // every posting list those centroids name contains the doc
            for centroid in from_postings {
                let mut found = false;
                inverted::scan_posting(&snap, 0, centroid, |d, _| {
                    found |= d == doc;
                    Ok(())
                })
                .unwrap();
                assert!(found);
            }
        }
    }

    #[test]
    fn test_upsert_idempotence_property() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a");
        let path_b = dir.path().join("b");

        let make = |path: &Path| {
            let db =
                LateDB::create(path, binarizer_schema(5, 1), IndexConfig::no_sync()).unwrap();
            db.train(&train_docs_constants()).unwrap();
            db
        };

        let old = Document::new(1).with_field(
            "colbert",
            FieldValue::Tensor(constant_tensor(20, 3.0)),
        );
        let new = Document::new(1)
            .with_field(
                "colbert",
                FieldValue::Tensor(constant_tensor(30, 1.0)),
            )
            .with_field("title", FieldValue::Text("final".into()));

        let a = make(&path_a);
        a.add(0, &[old]).unwrap();
        a.add(0, &[new.clone()]).unwrap();

        let b = make(&path_b);
        b.add(0, &[new]).unwrap();

        let snap_a = a.engine.snapshot();
        let snap_b = b.engine.snapshot();
        assert_eq!(
            forward::read_forward(&snap_a, 0, 1, 0).unwrap(),
            forward::read_forward(&snap_b, 0, 1, 0).unwrap()
        );
        assert_eq!(
            inverted::doc_centroids(&snap_a, 0, 1).unwrap(),
            inverted::doc_centroids(&snap_b, 0, 1).unwrap()
        );
        assert_eq!(
            stored::read_stored(&snap_a, 0, 1, 1).unwrap(),
            stored::read_stored(&snap_b, 0, 1, 1).unwrap()
        );
    }

    #[test]
    fn test_search_determinism_property() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        let a = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        let b = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_snapshot_copy_opens_identically() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());
        let copy_path = dir.path().join("copy");
        db.snapshot(&copy_path).unwrap();

        let before = db
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        let copy = LateDB::open(&copy_path).unwrap();
        let after = copy
            .search(0, &ones_query(), 10, &SearchOptions::default())
            .unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_term_and_vector_combinators() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());

        // And: only the doc whose title matches survives
        let q = Query::new(QueryNode::And(vec![
            QueryNode::vector("colbert", constant_tensor(100, 1.0)),
            QueryNode::term("title", FieldValue::Text("doc 3".into())),
        ]));
        let results = db.search(0, &q, 10, &SearchOptions::default()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].doc_id, 3);

        // Or: union of both term matches, ties by doc id
        let q = Query::new(QueryNode::Or(vec![
            QueryNode::term("title", FieldValue::Text("doc 4".into())),
            QueryNode::term("title", FieldValue::Text("doc 5".into())),
        ]));
        let results = db.search(0, &q, 10, &SearchOptions::default()).unwrap();
        let ids: Vec<DocId> = results.iter().map(|r| r.doc_id).collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn test_unknown_query_field() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());
        let q = Query::new(QueryNode::term("missing", FieldValue::Integer(1)));
        assert!(matches!(
            db.search(0, &q, 10, &SearchOptions::default()),
            Err(LateError::UnknownField(_))
        ));
    }

    #[test]
    fn test_cancelled_search() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());
        let cancel = || true;
        assert!(matches!(
            db.search_with_cancel(
                0,
                &ones_query(),
                10,
                &SearchOptions::default(),
                Some(&cancel)
            ),
            Err(LateError::Cancelled)
        ));
    }

    #[test]
    fn test_stats() {
        let dir = tempdir().unwrap();
        let db = setup_s1(dir.path());
        let stats = db.stats(0).unwrap();
        assert_eq!(stats.documents, 10);
        assert_eq!(stats.tokens, 1000);
        assert_eq!(db.stats(9).unwrap().documents, 0);
    }

    #[test]
    fn test_bulk_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index");
        {
            let db =
                LateDB::create(&path, binarizer_schema(5, 1), IndexConfig::no_sync()).unwrap();
            db.train(&train_docs_constants()).unwrap();
            db.set_bulk_load(true).unwrap();
            db.add(
                0,
                &[Document::new(1).with_field(
                    "colbert",
                    FieldValue::Tensor(constant_tensor(10, 1.0)),
                )],
            )
            .unwrap();
            db.set_bulk_load(false).unwrap();
        }
        let db = LateDB::open(&path).unwrap();
        assert_eq!(db.stats(0).unwrap().documents, 1);
    }

    #[test]
    fn test_import_centroids_then_add() {
        let dir = tempdir().unwrap();
        let db = LateDB::create(
            dir.path().join("index"),
            binarizer_schema(5, 1),
            IndexConfig::no_sync(),
        )
        .unwrap();

        // an externally produced codebook; residual training still runs
        let mut table = vec![0.0f32; 5 * DIM];
        for (i, row) in table.chunks_exact_mut(DIM).enumerate() {
            row[i] = 1.0;
        }
        db.import_centroids("colbert", table, &train_docs_constants())
            .unwrap();
        assert!(db.is_trained());

        db.add(
            0,
            &[Document::new(1).with_field(
                "colbert",
                FieldValue::Tensor(constant_tensor(10, 1.0)),
            )],
        )
        .unwrap();
        let results = db
            .search(
                0,
                &Query::new(QueryNode::vector("colbert", constant_tensor(10, 1.0))),
                10,
                &SearchOptions {
                    centroid_score_threshold: 0.0,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(results.len(), 1);
    }
}
