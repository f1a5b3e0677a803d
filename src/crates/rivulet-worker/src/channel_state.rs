//! Persists in-flight buffers for unaligned checkpoints.
//!
//! The barrier handler feeds this writer from two planes: buffers the task
//! thread consumes that predate the current barrier (the prefix of a
//! channel's queue at checkpoint start), and buffers the network plane
//! receives on channels that have not yet delivered the barrier (the
//! suffix). Sealing concatenates prefix and suffix, which is exactly the
//! channel's FIFO order, so replay reproduces the stream byte for byte.

use bytes::Bytes;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::{InputChannelInfo, ResultSubpartitionInfo};
use rivulet_checkpoint::{CheckpointId, InputChannelStateHandle, ResultSubpartitionStateHandle};
use std::collections::HashMap;
use tracing::trace;

#[derive(Default)]
struct PerChannel {
    consumed_prefix: Vec<Bytes>,
    received_suffix: Vec<Bytes>,
}

#[derive(Default)]
struct PerCheckpoint {
    input: HashMap<InputChannelInfo, PerChannel>,
    output: HashMap<ResultSubpartitionInfo, Vec<Bytes>>,
    aborted: bool,
}

/// Writer for one task's in-flight channel state, keyed by checkpoint.
#[derive(Default)]
pub struct ChannelStateWriter {
    checkpoints: Mutex<HashMap<CheckpointId, PerCheckpoint>>,
}

impl ChannelStateWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open bookkeeping for a checkpoint. Idempotent.
    pub fn start_checkpoint(&self, checkpoint_id: CheckpointId) {
        self.checkpoints
            .lock()
            .entry(checkpoint_id)
            .or_default();
    }

    /// A pre-barrier buffer the task thread consumed after the checkpoint
    /// started. Prefix of the channel's replay sequence.
    pub fn add_consumed_buffer(
        &self,
        checkpoint_id: CheckpointId,
        channel: InputChannelInfo,
        data: Bytes,
    ) {
        let mut checkpoints = self.checkpoints.lock();
        if let Some(cp) = checkpoints.get_mut(&checkpoint_id) {
            if !cp.aborted {
                cp.input.entry(channel).or_default().consumed_prefix.push(data);
            }
        }
    }

    /// A pre-barrier buffer received on a channel that has not yet delivered
    /// the barrier. Suffix of the channel's replay sequence.
    pub fn add_received_buffer(
        &self,
        checkpoint_id: CheckpointId,
        channel: InputChannelInfo,
        data: Bytes,
    ) {
        let mut checkpoints = self.checkpoints.lock();
        if let Some(cp) = checkpoints.get_mut(&checkpoint_id) {
            if !cp.aborted {
                cp.input.entry(channel).or_default().received_suffix.push(data);
            }
        }
    }

    /// Buffers a priority barrier overtook in one result subpartition.
    pub fn add_output_buffers(
        &self,
        checkpoint_id: CheckpointId,
        subpartition: ResultSubpartitionInfo,
        buffers: Vec<Bytes>,
    ) {
        let mut checkpoints = self.checkpoints.lock();
        if let Some(cp) = checkpoints.get_mut(&checkpoint_id) {
            if !cp.aborted {
                cp.output.entry(subpartition).or_default().extend(buffers);
            }
        }
    }

    /// Seal the checkpoint, producing the input and output handles and
    /// dropping the bookkeeping.
    pub fn seal(
        &self,
        checkpoint_id: CheckpointId,
    ) -> (
        Vec<InputChannelStateHandle>,
        Vec<ResultSubpartitionStateHandle>,
    ) {
        let Some(cp) = self.checkpoints.lock().remove(&checkpoint_id) else {
            return (Vec::new(), Vec::new());
        };
        trace!(checkpoint = %checkpoint_id, "sealing channel state");

        let mut input: Vec<InputChannelStateHandle> = cp
            .input
            .into_iter()
            .map(|(info, per_channel)| {
                let mut buffers = per_channel.consumed_prefix;
                buffers.extend(per_channel.received_suffix);
                InputChannelStateHandle { info, buffers }
            })
            .filter(|h| !h.buffers.is_empty())
            .collect();
        input.sort_by_key(|h| h.info);

        let mut output: Vec<ResultSubpartitionStateHandle> = cp
            .output
            .into_iter()
            .filter(|(_, buffers)| !buffers.is_empty())
            .map(|(info, buffers)| ResultSubpartitionStateHandle { info, buffers })
            .collect();
        output.sort_by_key(|h| h.info);

        (input, output)
    }

    /// Drop everything recorded for an aborted checkpoint and refuse later
    /// additions under its id.
    pub fn abort(&self, checkpoint_id: CheckpointId) {
        let mut checkpoints = self.checkpoints.lock();
        let cp = checkpoints.entry(checkpoint_id).or_default();
        cp.aborted = true;
        cp.input.clear();
        cp.output.clear();
    }

    pub fn has_checkpoint(&self, checkpoint_id: CheckpointId) -> bool {
        self.checkpoints.lock().contains_key(&checkpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(idx: u32) -> InputChannelInfo {
        InputChannelInfo::new(0, idx)
    }

    #[test]
    fn test_seal_concatenates_prefix_then_suffix() {
        let writer = ChannelStateWriter::new();
        let id = CheckpointId(7);
        writer.start_checkpoint(id);

        writer.add_received_buffer(id, channel(0), Bytes::from_static(b"c"));
        writer.add_consumed_buffer(id, channel(0), Bytes::from_static(b"a"));
        writer.add_consumed_buffer(id, channel(0), Bytes::from_static(b"b"));
        writer.add_received_buffer(id, channel(0), Bytes::from_static(b"d"));

        let (input, output) = writer.seal(id);
        assert!(output.is_empty());
        assert_eq!(input.len(), 1);
        let replay: Vec<&[u8]> = input[0].buffers.iter().map(|b| b.as_ref()).collect();
        assert_eq!(replay, vec![b"a".as_ref(), b"b", b"c", b"d"]);

        // Sealing drops the bookkeeping.
        assert!(!writer.has_checkpoint(id));
    }

    #[test]
    fn test_empty_channels_are_omitted() {
        let writer = ChannelStateWriter::new();
        let id = CheckpointId(1);
        writer.start_checkpoint(id);
        let (input, output) = writer.seal(id);
        assert!(input.is_empty());
        assert!(output.is_empty());
    }

    #[test]
    fn test_abort_discards_and_blocks_additions() {
        let writer = ChannelStateWriter::new();
        let id = CheckpointId(3);
        writer.start_checkpoint(id);
        writer.add_consumed_buffer(id, channel(0), Bytes::from_static(b"x"));

        writer.abort(id);
        writer.add_received_buffer(id, channel(0), Bytes::from_static(b"y"));

        let (input, _) = writer.seal(id);
        assert!(input.is_empty());
    }

    #[test]
    fn test_output_buffers_sealed_per_subpartition() {
        let writer = ChannelStateWriter::new();
        let id = CheckpointId(9);
        writer.start_checkpoint(id);
        writer.add_output_buffers(
            id,
            ResultSubpartitionInfo::new(0, 1),
            vec![Bytes::from_static(b"q1"), Bytes::from_static(b"q2")],
        );

        let (_, output) = writer.seal(id);
        assert_eq!(output.len(), 1);
        assert_eq!(output[0].buffers.len(), 2);
    }
}
