//! Unaligned checkpointing end to end at the task level: skewed inputs, a
//! real input gate, and the barrier flowing downstream ahead of alignment.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::InputChannelInfo;
use rivulet_checkpoint::{
    CheckpointBarrier, CheckpointId, CheckpointMetrics, CheckpointOptions, DeclineReason,
    TaskStateSnapshot,
};
use rivulet_core::gateway::{
    Ack, AccumulatorReport, JobMasterGateway, RegistrationResponse, SlotOffer,
    TaskExecutionStateTransition,
};
use rivulet_core::ids::{
    AllocationId, ExecutionAttemptId, ExecutionVertexId, JobId, JobMasterId, JobVertexId,
    ResourceId,
};
use rivulet_core::state::ExecutionState;
use rivulet_network::{
    AvailabilityListener, BufferConsumer, InputChannel, InputGate, NetworkBufferPool,
    PartitionMode, PipelinedSubpartition, ResultPartition, StreamFrame,
};
use rivulet_worker::{OperatorChain, RecordCounter, StreamTask, StreamTaskSpec};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct RecordingMaster {
    transitions: Mutex<Vec<ExecutionState>>,
    acks: Mutex<Vec<(CheckpointId, TaskStateSnapshot)>>,
    declines: Mutex<Vec<(CheckpointId, DeclineReason)>>,
}

#[async_trait]
impl JobMasterGateway for RecordingMaster {
    async fn register_task_manager(
        &self,
        _job_master_id: JobMasterId,
        _resource_id: ResourceId,
        _address: String,
    ) -> rivulet_core::Result<RegistrationResponse> {
        unimplemented!()
    }

    async fn offer_slots(
        &self,
        _job_master_id: JobMasterId,
        _resource_id: ResourceId,
        offers: Vec<SlotOffer>,
    ) -> rivulet_core::Result<Vec<SlotOffer>> {
        Ok(offers)
    }

    async fn fail_slot(
        &self,
        _job_master_id: JobMasterId,
        _resource_id: ResourceId,
        _allocation_id: AllocationId,
        _cause: String,
    ) -> rivulet_core::Result<Ack> {
        Ok(Ack)
    }

    async fn update_task_execution_state(
        &self,
        _job_master_id: JobMasterId,
        transition: TaskExecutionStateTransition,
    ) -> rivulet_core::Result<Ack> {
        self.transitions.lock().push(transition.state);
        Ok(Ack)
    }

    async fn request_next_input_split(
        &self,
        _job_master_id: JobMasterId,
        _vertex_id: JobVertexId,
        _execution_attempt_id: ExecutionAttemptId,
    ) -> rivulet_core::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn acknowledge_checkpoint(
        &self,
        _job_id: JobId,
        _execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        _metrics: CheckpointMetrics,
        state: TaskStateSnapshot,
    ) -> rivulet_core::Result<Ack> {
        self.acks.lock().push((checkpoint_id, state));
        Ok(Ack)
    }

    async fn decline_checkpoint(
        &self,
        _job_id: JobId,
        _execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> rivulet_core::Result<Ack> {
        self.declines.lock().push((checkpoint_id, reason));
        Ok(Ack)
    }

    async fn heartbeat_from_task_manager(
        &self,
        _resource_id: ResourceId,
        _report: AccumulatorReport,
    ) -> rivulet_core::Result<()> {
        Ok(())
    }

    async fn disconnect_task_manager(
        &self,
        _resource_id: ResourceId,
        _cause: String,
    ) -> rivulet_core::Result<Ack> {
        Ok(Ack)
    }
}

struct NullListener;

impl AvailabilityListener for NullListener {
    fn notify_data_available(&self) {}
}

fn unaligned_barrier(id: u64) -> StreamFrame {
    StreamFrame::from_barrier(CheckpointBarrier::new(
        CheckpointId(id),
        0,
        CheckpointOptions::unaligned(),
    ))
}

fn record(data: &'static [u8]) -> BufferConsumer {
    BufferConsumer::finished(Bytes::from_static(data))
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

/// Scenario: input 0 races ahead, input 1 is stalled. The task must emit its
/// downstream barrier on the first incoming barrier and only acknowledge
/// after the stalled channel catches up, with that channel's pre-barrier
/// records persisted in the snapshot.
#[tokio::test]
async fn test_skewed_unaligned_checkpoint() {
    let master = Arc::new(RecordingMaster::default());

    // Upstreams, driven directly by the test.
    let upstream_fast = Arc::new(PipelinedSubpartition::new(
        rivulet_checkpoint::ids::ResultSubpartitionInfo::new(0, 0),
    ));
    let upstream_slow = Arc::new(PipelinedSubpartition::new(
        rivulet_checkpoint::ids::ResultSubpartitionInfo::new(1, 0),
    ));

    let channels = vec![
        InputChannel::local(InputChannelInfo::new(0, 0), &upstream_fast).unwrap(),
        InputChannel::local(InputChannelInfo::new(0, 1), &upstream_slow).unwrap(),
    ];
    let gate = InputGate::new(0, channels);

    // Output we observe downstream.
    let output = Arc::new(ResultPartition::new(
        ExecutionAttemptId::new(),
        0,
        1,
        PartitionMode::Pipelined,
    ));
    let output_view = output
        .subpartition(0)
        .unwrap()
        .create_read_view(Arc::new(NullListener))
        .unwrap();

    let handle = StreamTask::spawn(StreamTaskSpec {
        job_id: JobId::new(),
        attempt_id: ExecutionAttemptId::new(),
        vertex_id: ExecutionVertexId::new(JobVertexId::new(), 0),
        name: "skewed-operator".to_string(),
        chain: OperatorChain::new(vec![Box::new(RecordCounter::new())]),
        gates: vec![gate],
        partitions: vec![Arc::clone(&output)],
        buffer_pool: Arc::new(NetworkBufferPool::new(64, 1024)),
        restore: None,
        job_master: master.clone(),
        job_master_id: JobMasterId::new(),
    });

    let master_running = master.clone();
    wait_until("task running", move || {
        master_running
            .transitions
            .lock()
            .contains(&ExecutionState::Running)
    })
    .await;

    // Fast input: records, then the barrier for checkpoint 7.
    for data in [b"f1" as &[u8], b"f2", b"f3"] {
        upstream_fast.add_buffer_consumer(BufferConsumer::finished(Bytes::copy_from_slice(data)), false);
    }
    upstream_fast.add_frame(unaligned_barrier(7));

    // Slow input: pre-barrier records, no barrier yet.
    upstream_slow.add_buffer_consumer(record(b"s1"), false);
    upstream_slow.add_buffer_consumer(record(b"s2"), false);

    // The downstream barrier must appear while input 1 is still stalled.
    let mut downstream = Vec::new();
    wait_until("downstream barrier emitted", || {
        while let Some(polled) = output_view.poll_next() {
            downstream.push(polled.frame);
        }
        downstream.iter().any(|f| f.barrier().map(|b| b.id) == Some(CheckpointId(7)))
    })
    .await;

    // No acknowledgement yet: alignment is still outstanding.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(master.acks.lock().is_empty());
    assert!(master.declines.lock().is_empty());

    // The stalled input delivers its barrier; the snapshot can seal.
    upstream_slow.add_frame(unaligned_barrier(7));

    let master_acked = master.clone();
    wait_until("checkpoint acknowledged", move || {
        !master_acked.acks.lock().is_empty()
    })
    .await;

    let (checkpoint_id, snapshot) = master.acks.lock()[0].clone();
    assert_eq!(checkpoint_id, CheckpointId(7));

    // The slow channel's pre-barrier records are in the snapshot.
    let slow_channel = InputChannelInfo::new(0, 1);
    let persisted: Vec<Vec<u8>> = snapshot
        .subtask_states
        .values()
        .flat_map(|s| s.input_channel_state.iter())
        .filter(|h| h.info == slow_channel)
        .flat_map(|h| h.buffers.iter().map(|b| b.to_vec()))
        .collect();
    assert_eq!(persisted, vec![b"s1".to_vec(), b"s2".to_vec()]);

    handle.cancel();
}

/// Scenario: while checkpoint 7 is pending, checkpoint 8 arrives. The task
/// aborts 7 with SUBSUMED before starting 8, and 7 is never acknowledged.
#[tokio::test]
async fn test_subsumed_checkpoint_declines_before_new_one() {
    let master = Arc::new(RecordingMaster::default());

    let upstream_a = Arc::new(PipelinedSubpartition::new(
        rivulet_checkpoint::ids::ResultSubpartitionInfo::new(0, 0),
    ));
    let upstream_b = Arc::new(PipelinedSubpartition::new(
        rivulet_checkpoint::ids::ResultSubpartitionInfo::new(1, 0),
    ));
    let channels = vec![
        InputChannel::local(InputChannelInfo::new(0, 0), &upstream_a).unwrap(),
        InputChannel::local(InputChannelInfo::new(0, 1), &upstream_b).unwrap(),
    ];
    let gate = InputGate::new(0, channels);

    let handle = StreamTask::spawn(StreamTaskSpec {
        job_id: JobId::new(),
        attempt_id: ExecutionAttemptId::new(),
        vertex_id: ExecutionVertexId::new(JobVertexId::new(), 0),
        name: "subsumed-operator".to_string(),
        chain: OperatorChain::forwarding(),
        gates: vec![gate],
        partitions: Vec::new(),
        buffer_pool: Arc::new(NetworkBufferPool::new(64, 1024)),
        restore: None,
        job_master: master.clone(),
        job_master_id: JobMasterId::new(),
    });

    let master_running = master.clone();
    wait_until("task running", move || {
        master_running
            .transitions
            .lock()
            .contains(&ExecutionState::Running)
    })
    .await;

    // Checkpoint 7 starts but never aligns; 8 overtakes on the same channel.
    upstream_a.add_frame(unaligned_barrier(7));
    tokio::time::sleep(Duration::from_millis(20)).await;
    upstream_a.add_frame(unaligned_barrier(8));

    let master_declined = master.clone();
    wait_until("checkpoint 7 declined as subsumed", move || {
        master_declined
            .declines
            .lock()
            .iter()
            .any(|(id, reason)| *id == CheckpointId(7) && *reason == DeclineReason::Subsumed)
    })
    .await;

    // 8 completes once the second channel catches up.
    upstream_b.add_frame(unaligned_barrier(8));
    let master_acked = master.clone();
    wait_until("checkpoint 8 acknowledged", move || {
        master_acked
            .acks
            .lock()
            .iter()
            .any(|(id, _)| *id == CheckpointId(8))
    })
    .await;
    assert!(!master.acks.lock().iter().any(|(id, _)| *id == CheckpointId(7)));

    handle.cancel();
}
