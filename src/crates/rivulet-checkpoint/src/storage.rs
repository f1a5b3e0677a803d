//! Storage abstraction for completed checkpoints.
//!
//! The coordinator persists the combined metadata of every finalized
//! checkpoint through [`CheckpointStorage`]. One storage instance is scoped
//! to one job; the high-availability layer decides what backs it. The
//! in-memory reference implementation lives in [`crate::memory`].

use crate::error::Result;
use crate::handle::OperatorState;
use crate::ids::{CheckpointId, OperatorId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

/// A finalized checkpoint: every expected task acknowledged and the combined
/// metadata was persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletedCheckpoint {
    pub checkpoint_id: CheckpointId,
    /// Trigger timestamp at the coordinator, epoch milliseconds.
    pub timestamp: i64,
    /// Wall-clock duration between trigger and finalization.
    pub duration_ms: u64,
    pub operator_states: HashMap<OperatorId, OperatorState>,
}

impl CompletedCheckpoint {
    pub fn state_size(&self) -> usize {
        self.operator_states
            .values()
            .flat_map(|op| op.subtask_states.values())
            .map(|s| s.in_flight_bytes())
            .sum()
    }
}

/// Snapshot sink for one job's checkpoint metadata.
#[async_trait]
pub trait CheckpointStorage: Send + Sync {
    /// Persist the metadata of a finalized checkpoint.
    async fn store_completed(&self, checkpoint: &CompletedCheckpoint) -> Result<()>;

    /// Load the completed checkpoint with the highest id, if any.
    async fn load_latest(&self) -> Result<Option<CompletedCheckpoint>>;

    /// Load a specific completed checkpoint.
    async fn load(&self, id: CheckpointId) -> Result<Option<CompletedCheckpoint>>;

    /// Drop a checkpoint that was subsumed or is no longer retained.
    async fn discard(&self, id: CheckpointId) -> Result<()>;
}

/// Bounded ring of the most recent completed checkpoints, kept by the
/// coordinator for restore decisions without a storage round trip.
#[derive(Debug)]
pub struct CompletedCheckpointStore {
    max_retained: usize,
    checkpoints: VecDeque<CompletedCheckpoint>,
}

impl CompletedCheckpointStore {
    /// `max_retained` must be at least 1; the latest checkpoint is always
    /// kept so global failover has a restore point.
    pub fn new(max_retained: usize) -> Self {
        Self {
            max_retained: max_retained.max(1),
            checkpoints: VecDeque::new(),
        }
    }

    /// Add a completed checkpoint, returning any evicted entries so the
    /// caller can discard them from storage.
    pub fn add(&mut self, checkpoint: CompletedCheckpoint) -> Vec<CompletedCheckpoint> {
        self.checkpoints.push_back(checkpoint);
        let mut evicted = Vec::new();
        while self.checkpoints.len() > self.max_retained {
            if let Some(old) = self.checkpoints.pop_front() {
                evicted.push(old);
            }
        }
        evicted
    }

    pub fn latest(&self) -> Option<&CompletedCheckpoint> {
        self.checkpoints.back()
    }

    pub fn all(&self) -> impl Iterator<Item = &CompletedCheckpoint> {
        self.checkpoints.iter()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(id: u64) -> CompletedCheckpoint {
        CompletedCheckpoint {
            checkpoint_id: CheckpointId(id),
            timestamp: id as i64,
            duration_ms: 1,
            operator_states: HashMap::new(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut store = CompletedCheckpointStore::new(2);
        assert!(store.add(completed(1)).is_empty());
        assert!(store.add(completed(2)).is_empty());
        let evicted = store.add(completed(3));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].checkpoint_id, CheckpointId(1));
        assert_eq!(store.latest().unwrap().checkpoint_id, CheckpointId(3));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_zero_retention_is_clamped_to_one() {
        let mut store = CompletedCheckpointStore::new(0);
        store.add(completed(5));
        assert_eq!(store.latest().unwrap().checkpoint_id, CheckpointId(5));
    }
}
