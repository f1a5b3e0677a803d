//! Error taxonomy for the runtime.
//!
//! Kinds follow the cluster's propagation policy: fatal errors terminate the
//! process through the component's on-fatal hook, job- and task-level
//! failures feed the failover strategy, and everything crossing an
//! asynchronous boundary arrives as a typed failure with a cause chain.

use crate::ids::{AllocationId, JobId, ResourceId};
use thiserror::Error;

/// Result type alias for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Unified error type for master and worker components.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A fenced RPC carried a token from a previous leader incarnation.
    #[error("fencing token mismatch: expected {expected}, received {received}")]
    FencingTokenMismatch { expected: String, received: String },

    /// The job id is already known, running or completed.
    #[error("duplicate job {0}")]
    DuplicateJob(JobId),

    /// The submitted job graph failed validation.
    #[error("invalid job: {0}")]
    InvalidJob(String),

    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("task executor {0} is not registered")]
    UnknownTaskExecutor(ResourceId),

    /// A slot request expired before a slot could be provided.
    #[error("slot request timed out after {timeout_ms} ms")]
    SlotRequestTimeout { timeout_ms: u64 },

    /// A promised allocation could not be fulfilled or was lost.
    #[error("allocation {allocation_id} failed: {cause}")]
    AllocationFailure {
        allocation_id: AllocationId,
        cause: String,
    },

    /// Reservation would exceed a declared resource budget.
    #[error("resource overallocation: {0}")]
    ResourceOverallocation(String),

    /// A peer missed heartbeats for longer than the configured timeout.
    #[error("heartbeat of {0} timed out")]
    HeartbeatTimeout(ResourceId),

    /// An RPC could not be delivered or the peer answered with a failure.
    #[error("rpc failure: {0}")]
    Rpc(String),

    /// The component's main executor was stopped while work was queued.
    #[error("component shut down: {0}")]
    ShutDown(String),

    /// Checkpoint subsystem failure, carried with its cause.
    #[error("checkpoint failure")]
    Checkpoint(#[from] rivulet_checkpoint::CheckpointError),

    /// Task-level failure, recoverable through the failover strategy.
    #[error("task failed: {0}")]
    TaskFailure(String),

    /// Job-level failure; the job transitions to FAILED.
    #[error("job failed: {0}")]
    JobFailure(String),

    /// Unrecoverable at process scope.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("io error")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl RuntimeError {
    /// Fatal errors must reach the process-level on-fatal hook instead of a
    /// failover strategy.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn rpc(msg: impl Into<String>) -> Self {
        Self::Rpc(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}

impl From<String> for RuntimeError {
    fn from(msg: String) -> Self {
        Self::Other(msg)
    }
}

impl From<&str> for RuntimeError {
    fn from(msg: &str) -> Self {
        Self::Other(msg.to_string())
    }
}
