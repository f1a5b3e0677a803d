//! Result partitions: the producer side of a network edge.

use crate::buffer::BufferConsumer;
use crate::error::{NetworkError, Result};
use crate::events::StreamFrame;
use crate::subpartition::{AvailabilityListener, PipelinedSubpartition, SubpartitionView};
use bytes::Bytes;
use parking_lot::RwLock;
use rivulet_checkpoint::ids::ResultSubpartitionInfo;
use rivulet_core::ids::ExecutionAttemptId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Consumption semantics of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionMode {
    /// Streaming: each subpartition is consumed exactly once while being
    /// produced; release happens when the producer releases.
    Pipelined,
    /// Batch-style: the partition is released once every subpartition has
    /// been drained by its consumer.
    ReleaseOnConsumption,
}

/// A finite or unbounded sequence of buffers split into subpartitions.
pub struct ResultPartition {
    producer: ExecutionAttemptId,
    partition_index: u32,
    mode: PartitionMode,
    subpartitions: Vec<Arc<PipelinedSubpartition>>,
    pending_consumptions: AtomicUsize,
    released: AtomicBool,
}

impl ResultPartition {
    pub fn new(
        producer: ExecutionAttemptId,
        partition_index: u32,
        num_subpartitions: u32,
        mode: PartitionMode,
    ) -> Self {
        let subpartitions = (0..num_subpartitions)
            .map(|i| {
                Arc::new(PipelinedSubpartition::new(ResultSubpartitionInfo::new(
                    partition_index,
                    i,
                )))
            })
            .collect();
        Self {
            producer,
            partition_index,
            mode,
            subpartitions,
            pending_consumptions: AtomicUsize::new(num_subpartitions as usize),
            released: AtomicBool::new(false),
        }
    }

    pub fn producer(&self) -> ExecutionAttemptId {
        self.producer
    }

    pub fn partition_index(&self) -> u32 {
        self.partition_index
    }

    pub fn num_subpartitions(&self) -> u32 {
        self.subpartitions.len() as u32
    }

    pub fn subpartition(&self, index: u32) -> Result<&Arc<PipelinedSubpartition>> {
        self.subpartitions
            .get(index as usize)
            .ok_or(NetworkError::UnknownSubpartition {
                partition_index: self.partition_index,
                subpartition_index: index,
            })
    }

    /// Emit one finished data buffer into a subpartition, outside any pool
    /// budget. Restore replay and tests use this; the task runner goes
    /// through [`add_data_buffer`](Self::add_data_buffer) with pooled
    /// buffers.
    pub fn emit(&self, subpartition_index: u32, data: Bytes) -> Result<()> {
        self.add_data_buffer(subpartition_index, BufferConsumer::finished(data))
    }

    /// Append a data buffer consumer to a subpartition.
    pub fn add_data_buffer(&self, subpartition_index: u32, consumer: BufferConsumer) -> Result<()> {
        let subpartition = self.subpartition(subpartition_index)?;
        if !subpartition.add_buffer_consumer(consumer, false) {
            return Err(NetworkError::SubpartitionReleased(subpartition.info()));
        }
        Ok(())
    }

    /// Deliver an event frame to every subpartition, e.g. a barrier.
    pub fn broadcast_frame(&self, frame: StreamFrame) {
        for subpartition in &self.subpartitions {
            subpartition.add_frame(frame.clone());
        }
    }

    pub fn create_view(
        &self,
        subpartition_index: u32,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<SubpartitionView> {
        self.subpartition(subpartition_index)?.create_read_view(listener)
    }

    pub fn flush_all(&self) {
        for subpartition in &self.subpartitions {
            subpartition.flush();
        }
    }

    /// Finish every subpartition; consumers observe end-of-partition.
    pub fn finish(&self) {
        for subpartition in &self.subpartitions {
            subpartition.finish();
        }
    }

    /// A consumer drained one subpartition. In release-on-consumption mode
    /// the partition releases itself when the last one is drained.
    pub fn notify_subpartition_consumed(&self, _subpartition_index: u32) {
        if self.mode != PartitionMode::ReleaseOnConsumption {
            return;
        }
        let before = self.pending_consumptions.fetch_sub(1, Ordering::SeqCst);
        if before == 1 {
            debug!(partition = self.partition_index, "all subpartitions drained, releasing");
            self.release();
        }
    }

    /// Per-subpartition in-flight snapshots taken by the latest priority
    /// barrier, for the channel state writer.
    pub fn take_inflight_snapshots(
        &self,
    ) -> Vec<(ResultSubpartitionInfo, Vec<crate::buffer::Buffer>)> {
        self.subpartitions
            .iter()
            .map(|s| (s.info(), s.take_inflight_snapshot()))
            .collect()
    }

    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        for subpartition in &self.subpartitions {
            subpartition.release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// Producer-side registry of the partitions a task executor hosts.
#[derive(Default)]
pub struct ResultPartitionManager {
    partitions: RwLock<HashMap<(ExecutionAttemptId, u32), Arc<ResultPartition>>>,
}

impl ResultPartitionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, partition: Arc<ResultPartition>) {
        self.partitions
            .write()
            .insert((partition.producer(), partition.partition_index()), partition);
    }

    pub fn get(
        &self,
        producer: ExecutionAttemptId,
        partition_index: u32,
    ) -> Result<Arc<ResultPartition>> {
        self.partitions
            .read()
            .get(&(producer, partition_index))
            .cloned()
            .ok_or_else(|| {
                NetworkError::PartitionNotFound(format!("{producer}/{partition_index}"))
            })
    }

    /// Release and drop every partition of one producer attempt.
    pub fn release_partitions_of(&self, producer: ExecutionAttemptId) {
        let mut partitions = self.partitions.write();
        partitions.retain(|(attempt, _), partition| {
            if *attempt == producer {
                partition.release();
                false
            } else {
                true
            }
        });
    }

    pub fn len(&self) -> usize {
        self.partitions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subpartition::AvailabilityListener;

    struct NullListener;

    impl AvailabilityListener for NullListener {
        fn notify_data_available(&self) {}
    }

    #[test]
    fn test_emit_routes_to_subpartition() {
        let partition =
            ResultPartition::new(ExecutionAttemptId::new(), 0, 2, PartitionMode::Pipelined);
        partition.emit(1, Bytes::from_static(b"r")).unwrap();

        let view = partition.create_view(1, Arc::new(NullListener)).unwrap();
        assert!(view.poll_next().is_some());

        let empty_view = partition.create_view(0, Arc::new(NullListener)).unwrap();
        assert!(empty_view.poll_next().is_none());
    }

    #[test]
    fn test_emit_to_unknown_subpartition_fails() {
        let partition =
            ResultPartition::new(ExecutionAttemptId::new(), 0, 1, PartitionMode::Pipelined);
        assert!(matches!(
            partition.emit(3, Bytes::from_static(b"r")),
            Err(NetworkError::UnknownSubpartition { .. })
        ));
    }

    #[test]
    fn test_release_on_consumption_releases_after_last_drain() {
        let partition = Arc::new(ResultPartition::new(
            ExecutionAttemptId::new(),
            0,
            2,
            PartitionMode::ReleaseOnConsumption,
        ));

        partition.notify_subpartition_consumed(0);
        assert!(!partition.is_released());
        partition.notify_subpartition_consumed(1);
        assert!(partition.is_released());
    }

    #[test]
    fn test_pipelined_partition_survives_consumption_notice() {
        let partition =
            ResultPartition::new(ExecutionAttemptId::new(), 0, 1, PartitionMode::Pipelined);
        partition.notify_subpartition_consumed(0);
        assert!(!partition.is_released());
    }

    #[test]
    fn test_manager_registry_roundtrip() {
        let manager = ResultPartitionManager::new();
        let producer = ExecutionAttemptId::new();
        manager.register(Arc::new(ResultPartition::new(
            producer,
            0,
            1,
            PartitionMode::Pipelined,
        )));

        assert!(manager.get(producer, 0).is_ok());
        assert!(manager.get(producer, 1).is_err());

        manager.release_partitions_of(producer);
        assert!(manager.is_empty());
        assert!(manager.get(producer, 0).is_err());
    }
}
