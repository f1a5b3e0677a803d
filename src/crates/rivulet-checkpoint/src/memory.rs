//! In-memory checkpoint storage for standalone clusters and tests.
//!
//! Data is lost on process restart; production deployments plug in a durable
//! [`CheckpointStorage`] through the high-availability layer instead.

use crate::error::Result;
use crate::ids::CheckpointId;
use crate::storage::{CheckpointStorage, CompletedCheckpoint};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Thread-safe map-backed storage, one instance per job.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStorage {
    checkpoints: RwLock<BTreeMap<CheckpointId, CompletedCheckpoint>>,
}

impl InMemoryCheckpointStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.checkpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.read().is_empty()
    }
}

#[async_trait]
impl CheckpointStorage for InMemoryCheckpointStorage {
    async fn store_completed(&self, checkpoint: &CompletedCheckpoint) -> Result<()> {
        self.checkpoints
            .write()
            .insert(checkpoint.checkpoint_id, checkpoint.clone());
        Ok(())
    }

    async fn load_latest(&self) -> Result<Option<CompletedCheckpoint>> {
        Ok(self
            .checkpoints
            .read()
            .iter()
            .next_back()
            .map(|(_, cp)| cp.clone()))
    }

    async fn load(&self, id: CheckpointId) -> Result<Option<CompletedCheckpoint>> {
        Ok(self.checkpoints.read().get(&id).cloned())
    }

    async fn discard(&self, id: CheckpointId) -> Result<()> {
        self.checkpoints.write().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn completed(id: u64) -> CompletedCheckpoint {
        CompletedCheckpoint {
            checkpoint_id: CheckpointId(id),
            timestamp: 0,
            duration_ms: 0,
            operator_states: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_load_latest_returns_highest_id() {
        let storage = InMemoryCheckpointStorage::new();
        storage.store_completed(&completed(2)).await.unwrap();
        storage.store_completed(&completed(9)).await.unwrap();
        storage.store_completed(&completed(4)).await.unwrap();

        let latest = storage.load_latest().await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, CheckpointId(9));
    }

    #[tokio::test]
    async fn test_discard_removes_checkpoint() {
        let storage = InMemoryCheckpointStorage::new();
        storage.store_completed(&completed(1)).await.unwrap();
        storage.discard(CheckpointId(1)).await.unwrap();
        assert!(storage.load(CheckpointId(1)).await.unwrap().is_none());
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_empty_storage_has_no_latest() {
        let storage = InMemoryCheckpointStorage::new();
        assert!(storage.load_latest().await.unwrap().is_none());
    }
}
