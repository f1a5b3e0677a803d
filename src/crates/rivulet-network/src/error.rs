//! Error types for the data path.

use rivulet_checkpoint::ids::ResultSubpartitionInfo;
use thiserror::Error;

/// Result type alias for data-path operations.
pub type Result<T> = std::result::Result<T, NetworkError>;

/// Errors raised by partitions, subpartitions and gates.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("subpartition {0} was already released")]
    SubpartitionReleased(ResultSubpartitionInfo),

    #[error("subpartition {0} already has a read view")]
    ViewAlreadyCreated(ResultSubpartitionInfo),

    #[error("result partition {partition_index} has no subpartition {subpartition_index}")]
    UnknownSubpartition {
        partition_index: u32,
        subpartition_index: u32,
    },

    #[error("result partition not registered: {0}")]
    PartitionNotFound(String),

    #[error("input channel is closed")]
    ChannelClosed,

    #[error("buffer pool exhausted")]
    PoolExhausted,
}
