//! The checkpoint barrier handler.
//!
//! One concrete handler covers both alignment modes; the barrier's options
//! select the strategy per checkpoint. Unaligned checkpoints forward the
//! barrier on first receipt and persist in-flight buffers through the
//! [`ChannelStateWriter`]; aligned checkpoints defer the snapshot until the
//! task thread has consumed the barrier on every open channel.
//!
//! All state sits behind a single per-task mutex because two thread sources
//! mutate it: the network receive plane (the input gate pumps) and the task
//! thread. Callbacks into the task only enqueue work and never block, so
//! they are safe to invoke with the lock held.

use crate::channel_state::ChannelStateWriter;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::InputChannelInfo;
use rivulet_checkpoint::{
    CancelCheckpointMarker, CheckpointBarrier, CheckpointId, CheckpointOptions, DeclineReason,
};
use rivulet_network::{Buffer, FrameListener};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Completes when every open channel has delivered the current barrier, or
/// exceptionally when the checkpoint is subsumed, canceled or cut off by
/// end-of-stream.
pub type AlignmentFuture = oneshot::Receiver<std::result::Result<(), DeclineReason>>;

/// The task-side hooks the handler schedules work through. Implementations
/// must only enqueue; the handler may call them while holding its monitor.
pub trait CheckpointableTask: Send + Sync {
    /// Start the operator snapshot for this barrier on the task thread.
    fn schedule_trigger_snapshot(&self, barrier: CheckpointBarrier);

    /// Abort a pending checkpoint on the task thread.
    fn schedule_abort_checkpoint(&self, checkpoint_id: CheckpointId, reason: DeclineReason);
}

struct ChannelFlags {
    /// True while the channel has not yet delivered the current barrier and
    /// newly received buffers must be persisted (unaligned only).
    store_new_buffers: bool,
    /// True between consumption of a new barrier id on some channel and
    /// consumption of the barrier on this one.
    has_inflight_buffers: bool,
    /// Channel has delivered the current barrier on the receive plane.
    barrier_seen: bool,
    /// Received-but-unconsumed data buffers on this channel.
    unconsumed: u64,
    /// Of those, how many predate the current checkpoint and still need to
    /// be persisted when the task consumes them.
    inflight_to_persist: u64,
    closed: bool,
}

impl ChannelFlags {
    fn new() -> Self {
        Self {
            store_new_buffers: false,
            has_inflight_buffers: false,
            barrier_seen: false,
            unconsumed: 0,
            inflight_to_persist: 0,
            closed: false,
        }
    }
}

struct HandlerState {
    channels: HashMap<InputChannelInfo, ChannelFlags>,
    num_open_channels: u32,
    num_barriers_received: u32,
    num_barriers_consumed: u32,
    /// Latest barrier id observed on any channel; -1 before the first.
    current_received: i64,
    /// Latest barrier id consumed by the task thread; -1 before the first.
    current_consumed: i64,
    current_options: CheckpointOptions,
    /// A checkpoint has been started on this task and neither acknowledged
    /// nor aborted.
    pending: bool,
    /// The current received id was aborted (cancel marker or end-of-stream).
    aborted_current: bool,
    alignment_tx: Option<oneshot::Sender<std::result::Result<(), DeclineReason>>>,
    alignment_rx: Option<AlignmentFuture>,
    /// Completed when the task thread has consumed the current barrier on
    /// every open channel; in-flight input state is complete at that point.
    consumption_tx: Option<oneshot::Sender<std::result::Result<(), DeclineReason>>>,
    consumption_rx: Option<AlignmentFuture>,
}

/// Per-task barrier handler; shared between the gate pumps and the task.
pub struct CheckpointBarrierHandler {
    state: Mutex<HandlerState>,
    writer: Arc<ChannelStateWriter>,
    task: Arc<dyn CheckpointableTask>,
}

impl CheckpointBarrierHandler {
    pub fn new(
        channels: Vec<InputChannelInfo>,
        writer: Arc<ChannelStateWriter>,
        task: Arc<dyn CheckpointableTask>,
    ) -> Self {
        let num_open_channels = channels.len() as u32;
        let channels = channels
            .into_iter()
            .map(|info| (info, ChannelFlags::new()))
            .collect();
        Self {
            state: Mutex::new(HandlerState {
                channels,
                num_open_channels,
                num_barriers_received: 0,
                num_barriers_consumed: 0,
                current_received: -1,
                current_consumed: -1,
                current_options: CheckpointOptions::unaligned(),
                pending: false,
                aborted_current: false,
                alignment_tx: None,
                alignment_rx: None,
                consumption_tx: None,
                consumption_rx: None,
            }),
            writer,
            task,
        }
    }

    pub fn writer(&self) -> &Arc<ChannelStateWriter> {
        &self.writer
    }

    /// The task thread consumed a data buffer from `channel`.
    pub fn on_buffer_consumed(&self, channel: InputChannelInfo, buffer: &Buffer) {
        let mut state = self.state.lock();
        let current = CheckpointId(state.current_received.max(0) as u64);
        let pending = state.pending;
        let unaligned = state.current_options.is_unaligned();
        let Some(flags) = state.channels.get_mut(&channel) else {
            return;
        };
        flags.unconsumed = flags.unconsumed.saturating_sub(1);
        if pending && unaligned && flags.inflight_to_persist > 0 {
            flags.inflight_to_persist -= 1;
            self.writer
                .add_consumed_buffer(current, channel, buffer.data.clone());
        }
    }

    /// The task thread consumed a barrier from `channel` (rule 3).
    pub fn on_barrier_consumed(&self, channel: InputChannelInfo, barrier: &CheckpointBarrier) {
        let mut state = self.state.lock();
        let b = barrier.id.0 as i64;

        if b < state.current_consumed || (b == state.current_consumed && !state.pending) {
            trace!(barrier = b, "ignoring stale consumed barrier");
            return;
        }

        if b > state.current_consumed {
            state.current_consumed = b;
            state.num_barriers_consumed = 0;
            for flags in state.channels.values_mut() {
                if !flags.closed {
                    flags.has_inflight_buffers = true;
                }
            }
        }

        if b == state.current_consumed {
            let mut just_consumed = false;
            if let Some(flags) = state.channels.get_mut(&channel) {
                if flags.has_inflight_buffers {
                    flags.has_inflight_buffers = false;
                    just_consumed = true;
                }
                // Everything predating the barrier on this channel has now
                // been consumed; nothing further to persist here.
                flags.inflight_to_persist = 0;
            }
            if just_consumed {
                state.num_barriers_consumed += 1;
            }
            // The prefix of every channel's in-flight state is complete once
            // the barrier of the *current* checkpoint was consumed
            // everywhere.
            if state.pending
                && state.current_consumed == state.current_received
                && state.num_barriers_consumed == state.num_open_channels
            {
                if let Some(tx) = state.consumption_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
        }

        // Deliver to the receive-plane bookkeeping if the barrier got here
        // first (defensive; pumps normally report receipt beforehand).
        if b > state.current_received
            || (b == state.current_received
                && state
                    .channels
                    .get(&channel)
                    .is_some_and(|f| !f.barrier_seen))
        {
            self.receive_barrier_locked(&mut state, channel, barrier);
            // Consumption may already be complete for a checkpoint that only
            // now became pending.
            if state.pending
                && state.current_consumed == state.current_received
                && state.num_barriers_consumed == state.num_open_channels
            {
                if let Some(tx) = state.consumption_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
        }

        // Aligned checkpoints snapshot once the task has seen the barrier on
        // every open channel.
        if state.pending
            && !state.current_options.is_unaligned()
            && state.num_barriers_consumed == state.num_open_channels
        {
            self.task.schedule_trigger_snapshot(*barrier);
        }
    }

    /// The alignment future of the current checkpoint: every open channel
    /// has delivered the barrier on the receive plane.
    pub fn take_alignment_future(&self) -> Option<AlignmentFuture> {
        self.state.lock().alignment_rx.take()
    }

    /// Completed once the task thread consumed the current barrier on every
    /// open channel; the snapshot seals input state after this.
    pub fn take_consumption_future(&self) -> Option<AlignmentFuture> {
        self.state.lock().consumption_rx.take()
    }

    /// The task acknowledged `checkpoint_id`; the handler stops treating it
    /// as pending.
    pub fn mark_checkpoint_acknowledged(&self, checkpoint_id: CheckpointId) {
        let mut state = self.state.lock();
        if state.pending && state.current_received == checkpoint_id.0 as i64 {
            state.pending = false;
        }
    }

    pub fn num_barriers_received(&self) -> u32 {
        self.state.lock().num_barriers_received
    }

    pub fn num_barriers_consumed(&self) -> u32 {
        self.state.lock().num_barriers_consumed
    }

    pub fn num_open_channels(&self) -> u32 {
        self.state.lock().num_open_channels
    }

    pub fn current_received_checkpoint_id(&self) -> i64 {
        self.state.lock().current_received
    }

    pub fn current_consumed_checkpoint_id(&self) -> i64 {
        self.state.lock().current_consumed
    }

    pub fn is_checkpoint_pending(&self) -> bool {
        self.state.lock().pending
    }

    /// Rule 2, with the monitor already held.
    fn receive_barrier_locked(
        &self,
        state: &mut HandlerState,
        channel: InputChannelInfo,
        barrier: &CheckpointBarrier,
    ) {
        let b = barrier.id.0 as i64;
        if state.channels.get(&channel).map_or(true, |f| f.closed) {
            return;
        }

        if b > state.current_received {
            // A new checkpoint begins on this task.
            let previous = state.current_received;
            if let Some(tx) = state.alignment_tx.take() {
                let _ = tx.send(Err(DeclineReason::Subsumed));
            }
            if let Some(tx) = state.consumption_tx.take() {
                let _ = tx.send(Err(DeclineReason::Subsumed));
            }
            if state.pending && previous >= 0 {
                let old_id = CheckpointId(previous as u64);
                self.writer.abort(old_id);
                self.task
                    .schedule_abort_checkpoint(old_id, DeclineReason::Subsumed);
            }

            state.current_received = b;
            state.current_options = barrier.options;
            state.aborted_current = false;
            state.pending = true;
            state.num_barriers_received = 0;

            let unaligned = barrier.options.is_unaligned();
            for flags in state.channels.values_mut() {
                if flags.closed {
                    continue;
                }
                flags.barrier_seen = false;
                flags.store_new_buffers = unaligned;
                flags.inflight_to_persist = if unaligned { flags.unconsumed } else { 0 };
            }

            let (tx, rx) = oneshot::channel();
            state.alignment_tx = Some(tx);
            state.alignment_rx = Some(rx);
            let (tx, rx) = oneshot::channel();
            state.consumption_tx = Some(tx);
            state.consumption_rx = Some(rx);

            self.writer.start_checkpoint(barrier.id);
            debug!(checkpoint = %barrier.id, unaligned, "new checkpoint observed");

            if unaligned {
                // Forward immediately; the snapshot starts now.
                self.task.schedule_trigger_snapshot(*barrier);
            }
        }

        if b == state.current_received && !state.aborted_current {
            if let Some(flags) = state.channels.get_mut(&channel) {
                if !flags.barrier_seen {
                    flags.barrier_seen = true;
                    flags.store_new_buffers = false;
                    state.num_barriers_received += 1;
                    if state.num_barriers_received == state.num_open_channels {
                        if let Some(tx) = state.alignment_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                }
            }
        }
    }

    fn abort_current_locked(&self, state: &mut HandlerState, reason: DeclineReason) {
        if let Some(tx) = state.alignment_tx.take() {
            let _ = tx.send(Err(reason));
        }
        if let Some(tx) = state.consumption_tx.take() {
            let _ = tx.send(Err(reason));
        }
        if state.pending && state.current_received >= 0 {
            let id = CheckpointId(state.current_received as u64);
            self.writer.abort(id);
            self.task.schedule_abort_checkpoint(id, reason);
        }
        state.pending = false;
        state.aborted_current = true;
        for flags in state.channels.values_mut() {
            flags.store_new_buffers = false;
            flags.inflight_to_persist = 0;
        }
    }
}

impl FrameListener for CheckpointBarrierHandler {
    /// Rule 1: persist or recycle a newly received buffer.
    fn on_buffer_received(&self, channel: InputChannelInfo, buffer: &Buffer) {
        let mut state = self.state.lock();
        let current = CheckpointId(state.current_received.max(0) as u64);
        let Some(flags) = state.channels.get_mut(&channel) else {
            return;
        };
        flags.unconsumed += 1;
        if flags.store_new_buffers {
            self.writer
                .add_received_buffer(current, channel, buffer.data.clone());
        }
    }

    /// Rule 2: a barrier arrived on the receive plane.
    fn on_barrier_received(&self, channel: InputChannelInfo, barrier: &CheckpointBarrier) {
        let mut state = self.state.lock();
        self.receive_barrier_locked(&mut state, channel, barrier);
    }

    /// Rule 4: the checkpoint was canceled at the source.
    fn on_cancel_marker(&self, _channel: InputChannelInfo, marker: &CancelCheckpointMarker) {
        let mut state = self.state.lock();
        let b = marker.id.0 as i64;
        if b < state.current_received {
            return;
        }
        state.current_received = b;
        self.abort_current_locked(&mut state, DeclineReason::Canceled);
    }

    /// Rule 5: a channel reached end-of-partition.
    fn on_end_of_partition(&self, channel: InputChannelInfo) {
        let mut state = self.state.lock();
        let Some(flags) = state.channels.get_mut(&channel) else {
            return;
        };
        if flags.closed {
            return;
        }
        flags.closed = true;
        state.num_open_channels = state.num_open_channels.saturating_sub(1);
        if state.pending {
            self.abort_current_locked(&mut state, DeclineReason::EndOfStream);
        }
    }
}
