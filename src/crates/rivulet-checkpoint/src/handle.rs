//! State handles produced by operator snapshots.
//!
//! A handle is an opaque pointer-plus-payload returned by a state backend.
//! The coordinator never looks inside one; it only groups handles per
//! operator and persists the combined metadata. The four handle kinds map to
//! the four futures an unaligned snapshot resolves: operator state, keyed
//! state, persisted input-channel buffers and persisted result-subpartition
//! buffers.

use crate::ids::{InputChannelInfo, OperatorId, ResultSubpartitionInfo};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Snapshot of one operator's non-keyed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStateHandle {
    pub operator_id: OperatorId,
    pub payload: Bytes,
}

/// Snapshot of one operator's keyed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyedStateHandle {
    pub operator_id: OperatorId,
    pub payload: Bytes,
}

/// Buffers that were in flight on one input channel when the barrier passed.
/// Replayed into the channel on restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelStateHandle {
    pub info: InputChannelInfo,
    pub buffers: Vec<Bytes>,
}

impl InputChannelStateHandle {
    pub fn new(info: InputChannelInfo) -> Self {
        Self {
            info,
            buffers: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.buffers.iter().map(|b| b.len()).sum()
    }
}

/// Buffers still queued in one result subpartition when the barrier was
/// emitted downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultSubpartitionStateHandle {
    pub info: ResultSubpartitionInfo,
    pub buffers: Vec<Bytes>,
}

/// Everything one operator contributed to one checkpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorSubtaskState {
    pub operator_state: Option<OperatorStateHandle>,
    pub keyed_state: Option<KeyedStateHandle>,
    pub input_channel_state: Vec<InputChannelStateHandle>,
    pub result_subpartition_state: Vec<ResultSubpartitionStateHandle>,
}

impl OperatorSubtaskState {
    pub fn is_empty(&self) -> bool {
        self.operator_state.is_none()
            && self.keyed_state.is_none()
            && self.input_channel_state.is_empty()
            && self.result_subpartition_state.is_empty()
    }

    /// Bytes persisted for in-flight data, both directions.
    pub fn in_flight_bytes(&self) -> usize {
        let input: usize = self.input_channel_state.iter().map(|h| h.total_bytes()).sum();
        let output: usize = self
            .result_subpartition_state
            .iter()
            .flat_map(|h| h.buffers.iter())
            .map(|b| b.len())
            .sum();
        input + output
    }
}

/// The full state a task reports when acknowledging a checkpoint, keyed by
/// the operators in its chain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStateSnapshot {
    pub subtask_states: HashMap<OperatorId, OperatorSubtaskState>,
}

impl TaskStateSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_subtask_state(&mut self, operator_id: OperatorId, state: OperatorSubtaskState) {
        self.subtask_states.insert(operator_id, state);
    }

    pub fn is_empty(&self) -> bool {
        self.subtask_states.values().all(|s| s.is_empty())
    }
}

/// Per-operator state across all parallel subtasks, as assembled by the
/// coordinator when a checkpoint completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorState {
    pub subtask_states: std::collections::BTreeMap<u32, OperatorSubtaskState>,
}

impl OperatorState {
    pub fn put(&mut self, subtask_index: u32, state: OperatorSubtaskState) {
        self.subtask_states.insert(subtask_index, state);
    }
}

/// Timing and volume metrics a task attaches to its acknowledgement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetrics {
    /// Time between barrier receipt and barrier alignment completion.
    pub alignment_duration_ms: u64,
    /// Time spent producing the state snapshot.
    pub sync_duration_ms: u64,
    /// Time spent writing the snapshot to the backend.
    pub async_duration_ms: u64,
    pub bytes_persisted: u64,
}
