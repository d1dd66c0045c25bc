//! Error types for the latedb retrieval engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LateError>;

#[derive(Error, Debug)]
pub enum LateError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Data corruption: {0}")]
    Corruption(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Index is not trained")]
    IndexUntrained,

    #[error("Invalid training data: {0}")]
    InvalidTraining(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("On-disk version {found} is newer than supported {supported}")]
    VersionTooNew { found: String, supported: String },

    #[error("Incompatible merge: {0}")]
    MergeIncompatible(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl From<bincode::Error> for LateError {
    fn from(err: bincode::Error) -> Self {
        LateError::Serialization(err.to_string())
    }
}
