//! Checkpoint barriers and the markers that travel with them.
//!
//! A barrier is a marker value injected into a stream at the source tasks.
//! It is neither a data record nor a recyclable buffer event, and it can
//! never overtake records within a channel. Everything downstream keys its
//! snapshot off the barrier's checkpoint id.

use crate::ids::CheckpointId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How the tasks align on a barrier before snapshotting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    /// Block channels that already delivered the barrier until the slowest
    /// channel catches up.
    Aligned,
    /// Forward the barrier on first receipt and persist in-flight buffers
    /// as part of the snapshot.
    Unaligned,
}

/// Options attached to a checkpoint when it is triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointOptions {
    pub checkpoint_type: CheckpointType,
}

impl CheckpointOptions {
    pub fn aligned() -> Self {
        Self {
            checkpoint_type: CheckpointType::Aligned,
        }
    }

    pub fn unaligned() -> Self {
        Self {
            checkpoint_type: CheckpointType::Unaligned,
        }
    }

    pub fn is_unaligned(&self) -> bool {
        self.checkpoint_type == CheckpointType::Unaligned
    }
}

/// The marker separating records of consecutive checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointBarrier {
    pub id: CheckpointId,
    /// Trigger timestamp at the coordinator, epoch milliseconds.
    pub timestamp: i64,
    pub options: CheckpointOptions,
}

impl CheckpointBarrier {
    pub fn new(id: CheckpointId, timestamp: i64, options: CheckpointOptions) -> Self {
        Self {
            id,
            timestamp,
            options,
        }
    }
}

impl fmt::Display for CheckpointBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "barrier(checkpoint {})", self.id)
    }
}

/// Sent downstream in place of a barrier when a checkpoint is aborted at the
/// source, so consumers stop waiting for barriers that will never arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCheckpointMarker {
    pub id: CheckpointId,
}

/// Why a task or the coordinator gave up on a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    /// A newer checkpoint overtook this one before it completed.
    Subsumed,
    /// An input channel reached end-of-partition while the checkpoint was
    /// still pending.
    EndOfStream,
    /// The coordinator-side concurrent-checkpoint limit was hit.
    TooManyCheckpoints,
    /// The pending checkpoint exceeded its deadline.
    Expired,
    /// A participating task failed.
    TaskFailure,
    /// The task was not ready to take a snapshot.
    TaskNotReady,
    /// The coordinator canceled the checkpoint; announced downstream by a
    /// cancel marker.
    Canceled,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Subsumed => write!(f, "subsumed by a newer checkpoint"),
            Self::EndOfStream => write!(f, "input reached end of stream"),
            Self::TooManyCheckpoints => write!(f, "too many concurrent checkpoints"),
            Self::Expired => write!(f, "checkpoint expired"),
            Self::TaskFailure => write!(f, "task failure"),
            Self::TaskNotReady => write!(f, "task not ready"),
            Self::Canceled => write!(f, "checkpoint canceled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_barrier_roundtrip_through_json() {
        let barrier = CheckpointBarrier::new(CheckpointId(3), 1_700_000_000_000, CheckpointOptions::unaligned());
        let json = serde_json::to_string(&barrier).unwrap();
        let restored: CheckpointBarrier = serde_json::from_str(&json).unwrap();
        assert_eq!(barrier, restored);
        assert!(restored.options.is_unaligned());
    }

    #[test]
    fn test_decline_reason_display() {
        assert_eq!(
            DeclineReason::TooManyCheckpoints.to_string(),
            "too many concurrent checkpoints"
        );
    }
}
