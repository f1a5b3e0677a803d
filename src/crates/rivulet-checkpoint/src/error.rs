//! Error types for checkpoint operations.

use crate::ids::CheckpointId;
use thiserror::Error;

/// Result type alias for checkpoint operations.
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint storage, serialization and bookkeeping.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The requested checkpoint is not known to the storage.
    #[error("checkpoint {0} not found")]
    NotFound(CheckpointId),

    /// A handle or metadata payload could not be serialized.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A handle or metadata payload could not be deserialized.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The storage backend rejected or failed the operation.
    #[error("checkpoint storage failure: {0}")]
    Storage(String),

    /// The checkpoint was aborted before it could be finalized.
    #[error("checkpoint {id} was aborted: {reason}")]
    Aborted { id: CheckpointId, reason: String },
}

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for CheckpointError {
    fn from(err: bincode::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
