//! Checkpointing primitives for the rivulet runtime.
//!
//! This crate holds everything the coordinator and the task side agree on
//! when taking a consistent snapshot: checkpoint identifiers, the barrier
//! markers injected into streams, the state handles produced by operator
//! snapshots, the storage abstraction completed checkpoints are persisted
//! through, and the serializer protocol used for handle payloads.
//!
//! Concrete state backends are out of scope; a backend is anything that
//! implements [`CheckpointStorage`] and hands back opaque handles.

pub mod barrier;
pub mod error;
pub mod handle;
pub mod ids;
pub mod memory;
pub mod serializer;
pub mod storage;

pub use barrier::{
    CancelCheckpointMarker, CheckpointBarrier, CheckpointOptions, CheckpointType, DeclineReason,
};
pub use error::{CheckpointError, Result};
pub use handle::{
    CheckpointMetrics, InputChannelStateHandle, KeyedStateHandle, OperatorState,
    OperatorStateHandle, OperatorSubtaskState, ResultSubpartitionStateHandle, TaskStateSnapshot,
};
pub use ids::{CheckpointId, InputChannelInfo, OperatorId, ResultSubpartitionInfo};
pub use memory::InMemoryCheckpointStorage;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use storage::{CheckpointStorage, CompletedCheckpoint, CompletedCheckpointStore};
