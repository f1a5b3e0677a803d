//! Identifiers shared between the checkpoint coordinator and the task side.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Monotonically increasing checkpoint identifier, scoped to one job.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct CheckpointId(pub u64);

impl CheckpointId {
    pub fn next(self) -> CheckpointId {
        CheckpointId(self.0 + 1)
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one logical operator inside an operator chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OperatorId(Uuid);

impl OperatorId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl Default for OperatorId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op-{}", &self.0.simple().to_string()[..8])
    }
}

/// Addresses one input channel of a task: which gate, which channel in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InputChannelInfo {
    pub gate_index: u32,
    pub channel_index: u32,
}

impl InputChannelInfo {
    pub fn new(gate_index: u32, channel_index: u32) -> Self {
        Self {
            gate_index,
            channel_index,
        }
    }
}

impl fmt::Display for InputChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gate {} channel {}", self.gate_index, self.channel_index)
    }
}

/// Addresses one result subpartition of a task's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ResultSubpartitionInfo {
    pub partition_index: u32,
    pub subpartition_index: u32,
}

impl ResultSubpartitionInfo {
    pub fn new(partition_index: u32, subpartition_index: u32) -> Self {
        Self {
            partition_index,
            subpartition_index,
        }
    }
}

impl fmt::Display for ResultSubpartitionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "partition {} subpartition {}",
            self.partition_index, self.subpartition_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_id_ordering() {
        let a = CheckpointId(7);
        let b = a.next();
        assert!(b > a);
        assert_eq!(b, CheckpointId(8));
    }

    #[test]
    fn test_operator_id_uniqueness() {
        assert_ne!(OperatorId::new(), OperatorId::new());
    }

    #[test]
    fn test_input_channel_info_display() {
        let info = InputChannelInfo::new(1, 3);
        assert_eq!(info.to_string(), "gate 1 channel 3");
    }
}
