//! Frames exchanged on a channel.
//!
//! Exactly the wire vocabulary of the data path; how a frame is encoded on a
//! concrete transport is the codec's business, not ours.

use crate::buffer::Buffer;
use rivulet_checkpoint::{CancelCheckpointMarker, CheckpointBarrier};

/// One element travelling through a subpartition or input channel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Buffer(Buffer),
    BarrierAligned(CheckpointBarrier),
    BarrierUnaligned(CheckpointBarrier),
    CancelCheckpointMarker(CancelCheckpointMarker),
    EndOfPartition,
    EndOfSuperstep,
}

impl StreamFrame {
    /// Wrap a barrier in the frame variant matching its options.
    pub fn from_barrier(barrier: CheckpointBarrier) -> Self {
        if barrier.options.is_unaligned() {
            Self::BarrierUnaligned(barrier)
        } else {
            Self::BarrierAligned(barrier)
        }
    }

    pub fn barrier(&self) -> Option<&CheckpointBarrier> {
        match self {
            Self::BarrierAligned(b) | Self::BarrierUnaligned(b) => Some(b),
            _ => None,
        }
    }

    pub fn is_event(&self) -> bool {
        !matches!(self, Self::Buffer(b) if b.is_buffer())
    }

    /// Barriers are the only frames inserted at the head of a subpartition
    /// queue; everything else appends.
    pub fn is_priority(&self) -> bool {
        matches!(self, Self::BarrierUnaligned(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rivulet_checkpoint::{CheckpointId, CheckpointOptions};

    #[test]
    fn test_from_barrier_picks_variant() {
        let aligned =
            CheckpointBarrier::new(CheckpointId(1), 0, CheckpointOptions::aligned());
        let unaligned =
            CheckpointBarrier::new(CheckpointId(2), 0, CheckpointOptions::unaligned());

        assert!(matches!(
            StreamFrame::from_barrier(aligned),
            StreamFrame::BarrierAligned(_)
        ));
        let frame = StreamFrame::from_barrier(unaligned);
        assert!(matches!(frame, StreamFrame::BarrierUnaligned(_)));
        assert!(frame.is_priority());
    }

    #[test]
    fn test_data_buffers_are_not_events() {
        let frame = StreamFrame::Buffer(Buffer::data_buffer(Bytes::from_static(b"r")));
        assert!(!frame.is_event());
        assert!(!frame.is_priority());
        assert!(StreamFrame::EndOfPartition.is_event());
    }
}
