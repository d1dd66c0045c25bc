//! Index structures over the storage engine
//!
//! - `coarse`: IVF centroid codebook and lookup
//! - `inverted`: centroid -> doc posting lists with count unwinding
//! - `forward`: per-document token records (centroid ids + codes)
//! - `stored`: opaque field payloads for hydration

pub mod coarse;
pub mod forward;
pub mod inverted;
pub mod stored;

pub use coarse::CoarseQuantizer;
pub use forward::ForwardRecord;

use crate::quantizer::ResidualCodec;
use crate::types::FieldId;
use ahash::AHashMap;

/// Trained tables of one indexed tensor field
#[derive(Debug, Clone)]
pub struct FieldIndex {
    pub coarse: CoarseQuantizer,
    pub codec: ResidualCodec,
}

/// Immutable post-training state, shared read-only by writer and readers
#[derive(Debug, Clone, Default)]
pub struct TrainedState {
    pub fields: AHashMap<FieldId, FieldIndex>,
}

impl TrainedState {
    pub fn field(&self, id: FieldId) -> Option<&FieldIndex> {
        self.fields.get(&id)
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
