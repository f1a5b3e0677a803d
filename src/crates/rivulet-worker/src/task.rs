//! The task runner: one spawned loop per task execution.
//!
//! The loop is the task thread of the checkpoint model: it consumes frames
//! from the input gates (whose pumps form the network plane), drives the
//! operator chain, and performs snapshots when the barrier handler or the
//! coordinator schedules them. State transitions are reported to the job
//! master through the normal gateway path; the master never assumes RUNNING
//! on its own.

use crate::barrier::{AlignmentFuture, CheckpointBarrierHandler, CheckpointableTask};
use crate::channel_state::ChannelStateWriter;
use crate::operator::OperatorChain;
use bytes::Bytes;
use rivulet_checkpoint::ids::InputChannelInfo;
use rivulet_checkpoint::{
    CheckpointBarrier, CheckpointId, CheckpointMetrics, DeclineReason, OperatorId,
    OperatorSubtaskState, TaskStateSnapshot,
};
use rivulet_core::gateway::{JobMasterGateway, TaskExecutionStateTransition, TaskRestore};
use rivulet_core::ids::{ExecutionAttemptId, ExecutionVertexId, JobId, JobMasterId};
use rivulet_core::state::ExecutionState;
use rivulet_network::{InputGate, NetworkBufferPool, ResultPartition, StreamFrame};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Everything needed to spawn one task execution.
pub struct StreamTaskSpec {
    pub job_id: JobId,
    pub attempt_id: ExecutionAttemptId,
    pub vertex_id: ExecutionVertexId,
    pub name: String,
    pub chain: OperatorChain,
    pub gates: Vec<InputGate>,
    pub partitions: Vec<Arc<ResultPartition>>,
    /// Worker-wide buffer budget records are written through.
    pub buffer_pool: Arc<NetworkBufferPool>,
    pub restore: Option<TaskRestore>,
    pub job_master: Arc<dyn JobMasterGateway>,
    pub job_master_id: JobMasterId,
}

enum TaskCommand {
    TriggerCheckpoint(CheckpointBarrier),
    PerformSnapshot(CheckpointBarrier),
    AbortCheckpoint(CheckpointId, DeclineReason),
    CheckpointCompleted(CheckpointId),
    CheckpointAborted(CheckpointId, DeclineReason),
    InjectRecord(Bytes),
    FinishInput,
    Cancel,
}

struct Mailbox {
    tx: mpsc::UnboundedSender<TaskCommand>,
}

impl CheckpointableTask for Mailbox {
    fn schedule_trigger_snapshot(&self, barrier: CheckpointBarrier) {
        let _ = self.tx.send(TaskCommand::PerformSnapshot(barrier));
    }

    fn schedule_abort_checkpoint(&self, checkpoint_id: CheckpointId, reason: DeclineReason) {
        let _ = self.tx.send(TaskCommand::AbortCheckpoint(checkpoint_id, reason));
    }
}

/// Control handle the task executor keeps for a running task.
pub struct TaskHandle {
    attempt_id: ExecutionAttemptId,
    tx: mpsc::UnboundedSender<TaskCommand>,
    join: tokio::task::JoinHandle<()>,
}

impl TaskHandle {
    pub fn attempt_id(&self) -> ExecutionAttemptId {
        self.attempt_id
    }

    pub fn trigger_checkpoint(&self, barrier: CheckpointBarrier) {
        let _ = self.tx.send(TaskCommand::TriggerCheckpoint(barrier));
    }

    pub fn notify_checkpoint_complete(&self, checkpoint_id: CheckpointId) {
        let _ = self.tx.send(TaskCommand::CheckpointCompleted(checkpoint_id));
    }

    pub fn notify_checkpoint_abort(&self, checkpoint_id: CheckpointId, reason: DeclineReason) {
        let _ = self.tx.send(TaskCommand::CheckpointAborted(checkpoint_id, reason));
    }

    /// Feed one record into a source task.
    pub fn inject_record(&self, record: Bytes) {
        let _ = self.tx.send(TaskCommand::InjectRecord(record));
    }

    /// Tell a source task its input is exhausted; it finishes cleanly.
    pub fn finish_input(&self) {
        let _ = self.tx.send(TaskCommand::FinishInput);
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(TaskCommand::Cancel);
    }

    pub fn abort_join(&self) {
        self.join.abort();
    }

    pub async fn join(self) {
        let _ = self.join.await;
    }
}

/// The running task. Construction wires the barrier handler between the
/// gates' receive plane and the task loop, then spawns the loop.
pub struct StreamTask;

impl StreamTask {
    pub fn spawn(spec: StreamTaskSpec) -> TaskHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let attempt_id = spec.attempt_id;

        let channel_infos: Vec<InputChannelInfo> = spec
            .gates
            .iter()
            .flat_map(|g| g.channel_infos())
            .collect();
        let writer = Arc::new(ChannelStateWriter::new());
        let handler = if channel_infos.is_empty() {
            None
        } else {
            let mailbox = Arc::new(Mailbox { tx: tx.clone() });
            Some(Arc::new(CheckpointBarrierHandler::new(
                channel_infos,
                Arc::clone(&writer),
                mailbox,
            )))
        };

        // Start the pumps; they report every frame to the handler at
        // receipt, before the loop below ever sees it.
        let gates: Vec<Arc<InputGate>> = spec.gates.into_iter().map(Arc::new).collect();
        if let Some(handler) = &handler {
            for gate in &gates {
                gate.start(Arc::clone(handler) as Arc<dyn rivulet_network::FrameListener>);
            }
        } else {
            for gate in &gates {
                gate.start(Arc::new(rivulet_network::NoOpFrameListener));
            }
        }

        // Merge all gates into one frame stream owned by the task thread.
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        for gate in &gates {
            let gate = Arc::clone(gate);
            let frame_tx = frame_tx.clone();
            tokio::spawn(async move {
                while let Some(item) = gate.poll_next().await {
                    if frame_tx.send(item).is_err() {
                        return;
                    }
                }
            });
        }
        drop(frame_tx);

        let mut runner = TaskRunner {
            job_id: spec.job_id,
            attempt_id,
            vertex_id: spec.vertex_id,
            name: spec.name,
            chain: spec.chain,
            partitions: spec.partitions,
            buffer_pool: spec.buffer_pool,
            next_subpartition: Vec::new(),
            restore: spec.restore,
            job_master: spec.job_master,
            job_master_id: spec.job_master_id,
            handler,
            writer,
            has_inputs: !gates.is_empty(),
            gates,
            last_snapshot: -1,
        };
        runner.next_subpartition = vec![0; runner.partitions.len()];

        let join = tokio::spawn(async move {
            runner.run(rx, frame_rx).await;
        });

        TaskHandle {
            attempt_id,
            tx,
            join,
        }
    }
}

struct TaskRunner {
    job_id: JobId,
    attempt_id: ExecutionAttemptId,
    vertex_id: ExecutionVertexId,
    name: String,
    chain: OperatorChain,
    partitions: Vec<Arc<ResultPartition>>,
    buffer_pool: Arc<NetworkBufferPool>,
    next_subpartition: Vec<u32>,
    restore: Option<TaskRestore>,
    job_master: Arc<dyn JobMasterGateway>,
    job_master_id: JobMasterId,
    handler: Option<Arc<CheckpointBarrierHandler>>,
    writer: Arc<ChannelStateWriter>,
    has_inputs: bool,
    gates: Vec<Arc<InputGate>>,
    /// Highest checkpoint id this task started a snapshot for.
    last_snapshot: i64,
}

impl TaskRunner {
    async fn run(
        &mut self,
        mut control: mpsc::UnboundedReceiver<TaskCommand>,
        mut frames: mpsc::UnboundedReceiver<(InputChannelInfo, StreamFrame)>,
    ) {
        if let Err(e) = self.restore_if_needed().await {
            warn!(task = %self.name, "restore failed: {e}");
            self.report_state(ExecutionState::Failed, Some(e.to_string())).await;
            return;
        }

        info!(
            task = %self.name,
            vertex = %self.vertex_id,
            attempt = %self.attempt_id,
            "task entering RUNNING"
        );
        self.report_state(ExecutionState::Running, None).await;

        let mut inputs_done = !self.has_inputs;
        loop {
            tokio::select! {
                biased;

                cmd = control.recv() => {
                    match cmd {
                        None => break,
                        Some(cmd) => {
                            if self.handle_command(cmd).await {
                                return;
                            }
                        }
                    }
                }

                frame = frames.recv(), if !inputs_done => {
                    match frame {
                        None => {
                            inputs_done = true;
                            self.finish().await;
                            return;
                        }
                        Some((channel, frame)) => self.handle_frame(channel, frame).await,
                    }
                }
            }
        }
    }

    /// Returns true when the task loop must stop.
    async fn handle_command(&mut self, cmd: TaskCommand) -> bool {
        match cmd {
            TaskCommand::TriggerCheckpoint(barrier) | TaskCommand::PerformSnapshot(barrier) => {
                self.perform_snapshot(barrier);
                false
            }
            TaskCommand::AbortCheckpoint(checkpoint_id, reason) => {
                debug!(task = %self.name, checkpoint = %checkpoint_id, %reason, "aborting checkpoint");
                self.writer.abort(checkpoint_id);
                self.chain.notify_checkpoint_abort(checkpoint_id);
                let _ = self
                    .job_master
                    .decline_checkpoint(self.job_id, self.attempt_id, checkpoint_id, reason)
                    .await;
                false
            }
            TaskCommand::CheckpointCompleted(checkpoint_id) => {
                self.chain.notify_checkpoint_complete(checkpoint_id);
                false
            }
            TaskCommand::CheckpointAborted(checkpoint_id, reason) => {
                self.writer.abort(checkpoint_id);
                self.chain.notify_checkpoint_abort(checkpoint_id);
                // Announce downstream so consumers stop waiting.
                for partition in &self.partitions {
                    partition.broadcast_frame(StreamFrame::CancelCheckpointMarker(
                        rivulet_checkpoint::CancelCheckpointMarker { id: checkpoint_id },
                    ));
                }
                let _ = reason;
                false
            }
            TaskCommand::InjectRecord(record) => {
                self.process_record(record).await;
                false
            }
            TaskCommand::FinishInput => {
                self.finish().await;
                true
            }
            TaskCommand::Cancel => {
                info!(task = %self.name, "task canceled");
                for partition in &self.partitions {
                    partition.release();
                }
                self.shutdown_gates();
                self.report_state(ExecutionState::Canceled, None).await;
                true
            }
        }
    }

    async fn handle_frame(&mut self, channel: InputChannelInfo, frame: StreamFrame) {
        match frame {
            StreamFrame::Buffer(buffer) if buffer.is_buffer() => {
                if let Some(handler) = &self.handler {
                    handler.on_buffer_consumed(channel, &buffer);
                }
                self.process_record(buffer.data).await;
            }
            StreamFrame::Buffer(_) => {}
            StreamFrame::BarrierAligned(barrier) | StreamFrame::BarrierUnaligned(barrier) => {
                if let Some(handler) = &self.handler {
                    handler.on_barrier_consumed(channel, &barrier);
                }
            }
            // Receipt-plane callbacks already handled these.
            StreamFrame::CancelCheckpointMarker(_) => {}
            StreamFrame::EndOfPartition => {}
            StreamFrame::EndOfSuperstep => {}
        }
    }

    async fn process_record(&mut self, record: Bytes) {
        let outputs = match self.chain.process_record(record) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!(task = %self.name, "record processing failed: {e}");
                return;
            }
        };
        for output in outputs {
            self.emit(output).await;
        }
    }

    /// Write one record into every output partition. Waits on the buffer
    /// pool when the budget is exhausted, which is where memory
    /// backpressure stalls the task thread.
    async fn emit(&mut self, record: Bytes) {
        for (index, partition) in self.partitions.iter().enumerate() {
            let subpartition = self.next_subpartition[index] % partition.num_subpartitions().max(1);
            self.next_subpartition[index] = subpartition + 1;
            let (builder, consumer) = match self.buffer_pool.request_buffer().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(task = %self.name, "buffer request failed: {e}");
                    return;
                }
            };
            builder.append(&record);
            builder.finish();
            if let Err(e) = partition.add_data_buffer(subpartition, consumer) {
                warn!(task = %self.name, "emit failed: {e}");
            }
            partition.flush_all();
        }
    }

    /// Rule 6: the operator snapshot, started at most once per barrier.
    fn perform_snapshot(&mut self, barrier: CheckpointBarrier) {
        let id = barrier.id;
        if (id.0 as i64) <= self.last_snapshot {
            return;
        }
        self.last_snapshot = id.0 as i64;
        debug!(task = %self.name, checkpoint = %id, "starting snapshot");

        // Source tasks have no receive plane to open the bookkeeping.
        self.writer.start_checkpoint(id);

        // Synchronous part on the task thread.
        let operator_states = match self.chain.snapshot_all(id) {
            Ok(states) => states,
            Err(e) => {
                warn!(task = %self.name, checkpoint = %id, "snapshot failed: {e}");
                let job_master = Arc::clone(&self.job_master);
                let (job_id, attempt_id) = (self.job_id, self.attempt_id);
                tokio::spawn(async move {
                    let _ = job_master
                        .decline_checkpoint(job_id, attempt_id, id, DeclineReason::TaskFailure)
                        .await;
                });
                return;
            }
        };

        // Emit the barrier downstream immediately, then record what it
        // overtook in each subpartition.
        let unaligned = barrier.options.is_unaligned();
        for partition in &self.partitions {
            partition.broadcast_frame(StreamFrame::from_barrier(barrier));
            if unaligned {
                for (info, buffers) in partition.take_inflight_snapshots() {
                    self.writer.add_output_buffers(
                        id,
                        info,
                        buffers.into_iter().map(|b| b.data).collect(),
                    );
                }
            }
        }

        // Asynchronous part: wait for alignment and for the task thread to
        // finish consuming pre-barrier data, then seal and acknowledge.
        let alignment = self.handler.as_ref().and_then(|h| h.take_alignment_future());
        let consumption = self
            .handler
            .as_ref()
            .and_then(|h| h.take_consumption_future());
        let operator_ids = self.chain.operator_ids();
        let writer = Arc::clone(&self.writer);
        let handler = self.handler.clone();
        let job_master = Arc::clone(&self.job_master);
        let (job_id, attempt_id, has_inputs) = (self.job_id, self.attempt_id, self.has_inputs);
        let task_name = self.name.clone();

        tokio::spawn(async move {
            let await_phase = |rx: Option<AlignmentFuture>| async {
                match rx {
                    Some(rx) => match rx.await {
                        Ok(result) => result,
                        Err(_) => Err(DeclineReason::TaskFailure),
                    },
                    // Sources align trivially; a missing future on an input
                    // task means the checkpoint was already superseded.
                    None if has_inputs => Err(DeclineReason::Subsumed),
                    None => Ok(()),
                }
            };
            let alignment_result = match await_phase(alignment).await {
                Ok(()) => await_phase(consumption).await,
                err => err,
            };

            match alignment_result {
                Ok(()) => {
                    let (input_state, output_state) = writer.seal(id);
                    let snapshot =
                        assemble_snapshot(operator_ids, operator_states, input_state, output_state);
                    let metrics = CheckpointMetrics {
                        bytes_persisted: snapshot
                            .subtask_states
                            .values()
                            .map(|s| s.in_flight_bytes() as u64)
                            .sum(),
                        ..Default::default()
                    };
                    if let Err(e) = job_master
                        .acknowledge_checkpoint(job_id, attempt_id, id, metrics, snapshot)
                        .await
                    {
                        warn!(task = %task_name, checkpoint = %id, "acknowledge failed: {e}");
                    }
                    if let Some(handler) = handler {
                        handler.mark_checkpoint_acknowledged(id);
                    }
                }
                Err(reason) => {
                    writer.abort(id);
                    let _ = job_master
                        .decline_checkpoint(job_id, attempt_id, id, reason)
                        .await;
                }
            }
        });
    }

    async fn restore_if_needed(&mut self) -> rivulet_core::Result<()> {
        let Some(restore) = self.restore.take() else {
            return Ok(());
        };
        info!(task = %self.name, checkpoint = %restore.checkpoint_id, "restoring task state");
        self.chain.restore_all(&restore.state)?;

        // Replay persisted in-flight data: input buffers run through the
        // chain as if they had just arrived, output buffers are re-emitted
        // verbatim.
        for state in restore.state.subtask_states.values() {
            for handle in &state.input_channel_state {
                for buffer in &handle.buffers {
                    self.process_record(buffer.clone()).await;
                }
            }
            for handle in &state.result_subpartition_state {
                for buffer in &handle.buffers {
                    let target = handle.info.subpartition_index;
                    for partition in &self.partitions {
                        if partition.partition_index() == handle.info.partition_index {
                            let _ = partition.emit(target, buffer.clone());
                            partition.flush_all();
                        }
                    }
                }
            }
        }
        Ok(())
    }

    async fn finish(&mut self) {
        info!(task = %self.name, "task finished");
        for partition in &self.partitions {
            partition.finish();
        }
        self.shutdown_gates();
        self.report_state(ExecutionState::Finished, None).await;
    }

    fn shutdown_gates(&self) {
        for gate in &self.gates {
            gate.shutdown();
        }
    }

    async fn report_state(&self, state: ExecutionState, error: Option<String>) {
        let transition = TaskExecutionStateTransition {
            execution_attempt_id: self.attempt_id,
            state,
            error,
            accumulators: HashMap::new(),
        };
        if let Err(e) = self
            .job_master
            .update_task_execution_state(self.job_master_id, transition)
            .await
        {
            warn!(task = %self.name, "state report failed: {e}");
        }
    }
}

fn assemble_snapshot(
    operator_ids: Vec<OperatorId>,
    mut operator_states: HashMap<OperatorId, OperatorSubtaskState>,
    input_state: Vec<rivulet_checkpoint::InputChannelStateHandle>,
    output_state: Vec<rivulet_checkpoint::ResultSubpartitionStateHandle>,
) -> TaskStateSnapshot {
    // In-flight input data belongs to the head operator, output data to the
    // tail; restore replays them in that order.
    if let Some(head) = operator_ids.first() {
        operator_states
            .entry(*head)
            .or_default()
            .input_channel_state = input_state;
    }
    if let Some(tail) = operator_ids.last() {
        operator_states
            .entry(*tail)
            .or_default()
            .result_subpartition_state = output_state;
    }
    TaskStateSnapshot {
        subtask_states: operator_states,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::{OperatorChain, RecordCounter};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use rivulet_checkpoint::CheckpointOptions;
    use rivulet_core::gateway::{Ack, AccumulatorReport, RegistrationResponse, SlotOffer};
    use rivulet_core::ids::{AllocationId, JobVertexId, ResourceId};
    use rivulet_network::{NetworkBufferPool, PartitionMode};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingMaster {
        transitions: PlMutex<Vec<ExecutionState>>,
        acks: PlMutex<Vec<(CheckpointId, TaskStateSnapshot)>>,
        declines: PlMutex<Vec<(CheckpointId, DeclineReason)>>,
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
            _vertex_id: rivulet_core::ids::JobVertexId,
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

    fn source_spec(
        master: Arc<RecordingMaster>,
        partitions: Vec<Arc<ResultPartition>>,
    ) -> StreamTaskSpec {
        StreamTaskSpec {
            job_id: JobId::new(),
            attempt_id: ExecutionAttemptId::new(),
            vertex_id: ExecutionVertexId::new(JobVertexId::new(), 0),
            name: "source".to_string(),
            chain: OperatorChain::new(vec![Box::new(RecordCounter::new())]),
            gates: Vec::new(),
            partitions,
            buffer_pool: Arc::new(NetworkBufferPool::new(64, 1024)),
            restore: None,
            job_master: master,
            job_master_id: JobMasterId::new(),
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_source_task_reports_running_then_finished() {
        let master = Arc::new(RecordingMaster::default());
        let handle = StreamTask::spawn(source_spec(master.clone(), Vec::new()));

        wait_until(|| master.transitions.lock().contains(&ExecutionState::Running)).await;
        handle.finish_input();
        wait_until(|| master.transitions.lock().contains(&ExecutionState::Finished)).await;
    }

    #[tokio::test]
    async fn test_source_checkpoint_broadcasts_barrier_and_acks() {
        let master = Arc::new(RecordingMaster::default());
        let partition = Arc::new(ResultPartition::new(
            ExecutionAttemptId::new(),
            0,
            1,
            PartitionMode::Pipelined,
        ));
        let subpartition = Arc::clone(partition.subpartition(0).unwrap());

        let handle = StreamTask::spawn(source_spec(master.clone(), vec![partition]));
        wait_until(|| master.transitions.lock().contains(&ExecutionState::Running)).await;

        handle.inject_record(Bytes::from_static(b"r1"));
        handle.trigger_checkpoint(CheckpointBarrier::new(
            CheckpointId(1),
            0,
            CheckpointOptions::unaligned(),
        ));

        wait_until(|| !master.acks.lock().is_empty()).await;
        let (id, snapshot) = master.acks.lock()[0].clone();
        assert_eq!(id, CheckpointId(1));
        assert!(!snapshot.is_empty());

        // The barrier went downstream.
        struct Null;
        impl rivulet_network::AvailabilityListener for Null {
            fn notify_data_available(&self) {}
        }
        let view = subpartition.create_read_view(Arc::new(Null)).unwrap();
        let mut saw_barrier = false;
        while let Some(polled) = view.poll_next() {
            if polled.frame.barrier().is_some() {
                saw_barrier = true;
            }
        }
        assert!(saw_barrier);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_duplicate_trigger_snapshots_once() {
        let master = Arc::new(RecordingMaster::default());
        let handle = StreamTask::spawn(source_spec(master.clone(), Vec::new()));
        wait_until(|| master.transitions.lock().contains(&ExecutionState::Running)).await;

        let barrier =
            CheckpointBarrier::new(CheckpointId(3), 0, CheckpointOptions::unaligned());
        handle.trigger_checkpoint(barrier);
        handle.trigger_checkpoint(barrier);

        wait_until(|| !master.acks.lock().is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(master.acks.lock().len(), 1);
        handle.cancel();
    }

    #[tokio::test]
    async fn test_cancel_reports_canceled() {
        let master = Arc::new(RecordingMaster::default());
        let handle = StreamTask::spawn(source_spec(master.clone(), Vec::new()));
        wait_until(|| master.transitions.lock().contains(&ExecutionState::Running)).await;

        handle.cancel();
        wait_until(|| master.transitions.lock().contains(&ExecutionState::Canceled)).await;
    }
}
