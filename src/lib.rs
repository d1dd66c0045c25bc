//! LateDB Retrieval Engine
//!
//! Embedded vector-search engine for late-interaction retrieval
//! (ColBERT-family models): every document is a sequence of per-token
//! embedding vectors, and ranking is the two-stage PLAID pipeline of a
//! centroid-score pre-filter followed by exact MaxSim on reconstructed
//! residual vectors.
//!
//! ## Architecture
//! - Storage layer: column-family KV engine (WAL + checkpoint) with
//!   atomic batches and snapshot reads
//! - Quantization layer: IVF centroid codebook + residual codecs
//!   (binarizer / product quantizer / raw)
//! - Index layer: inverted posting lists, forward token records,
//!   stored field payloads, all tenant-prefixed
//! - Query layer: term / vector leaves with boolean combinators
//!
//! ## Concurrency
//! Single-writer, many-reader, in-process. Writers serialize on an
//! engine-wide mutex; every search runs against a pinned storage
//! snapshot.

pub mod config;
pub mod database;
pub mod distance;
pub mod index;
pub mod query;
pub mod quantizer;
pub mod retriever;
pub mod schema;
pub mod storage;
pub mod types;
pub mod writer;

mod error;

pub use config::{DurabilityLevel, IndexConfig};
pub use database::{IndexStats, LateDB, SearchResult, FORMAT_VERSION};
pub use error::{LateError, Result};
pub use query::{Query, QueryNode};
pub use quantizer::{Binarizer, ProductQuantizer, ResidualCodec};
pub use retriever::{ScoredDoc, SearchOptions};
pub use schema::{DataType, Field, FieldParameters, QuantizerType, Schema};
pub use types::{DocId, Document, FieldValue, TenantId, Tensor};
