//! Opaque identifiers used across the cluster.
//!
//! All are 128-bit random values except [`SlotId`], which is a composite of
//! the owning worker and a slot index. [`JobMasterId`] and
//! [`ResourceManagerId`] double as leader fencing tokens: every fenced RPC
//! carries one, and receivers reject messages bearing a stale token.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), &self.0.simple().to_string()[..8])
            }
        }
    };
}

uuid_id!(
    /// Identifies one submitted job for its lifetime.
    JobId,
    "job"
);
uuid_id!(
    /// Identifies one attempt of one execution vertex. A fresh id is minted
    /// for every restart.
    ExecutionAttemptId,
    "attempt"
);
uuid_id!(
    /// A promise to reserve one slot on one worker for one job. Never
    /// reused over the cluster's lifetime.
    AllocationId,
    "alloc"
);
uuid_id!(
    /// Identifies a worker process for its lifetime.
    ResourceId,
    "worker"
);
uuid_id!(
    /// Leader fencing token of a job master incarnation.
    JobMasterId,
    "jm"
);
uuid_id!(
    /// Leader fencing token of a resource manager incarnation.
    ResourceManagerId,
    "rm"
);
uuid_id!(
    /// Identifies one slot request issued by the scheduler to the slot pool.
    SlotRequestId,
    "slotreq"
);
uuid_id!(
    /// Identifies one vertex of the logical job graph.
    JobVertexId,
    "vertex"
);
uuid_id!(
    /// Handed out on successful registration; fences later heartbeats and
    /// reports against registrations from a previous incarnation.
    RegistrationId,
    "reg"
);

/// Counts the attempts of one execution vertex; strictly increasing across
/// failover resets, so a stale report can always be told from a current one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct AttemptNumber(pub u32);

impl AttemptNumber {
    pub fn first() -> Self {
        Self(0)
    }

    pub fn next(self) -> AttemptNumber {
        AttemptNumber(self.0 + 1)
    }
}

impl fmt::Display for AttemptNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one slot on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId {
    pub resource_id: ResourceId,
    pub slot_index: u32,
}

impl SlotId {
    pub fn new(resource_id: ResourceId, slot_index: u32) -> Self {
        Self {
            resource_id,
            slot_index,
        }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/slot-{}", self.resource_id, self.slot_index)
    }
}

/// Addresses one parallel subtask of a job vertex in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionVertexId {
    pub vertex_id: JobVertexId,
    pub subtask_index: u32,
}

impl ExecutionVertexId {
    pub fn new(vertex_id: JobVertexId, subtask_index: u32) -> Self {
        Self {
            vertex_id,
            subtask_index,
        }
    }
}

impl fmt::Display for ExecutionVertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.vertex_id, self.subtask_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_ne!(AllocationId::new(), AllocationId::new());
        assert_ne!(ResourceId::new(), ResourceId::new());
    }

    #[test]
    fn test_slot_id_display() {
        let slot = SlotId::new(ResourceId::new(), 2);
        assert!(slot.to_string().ends_with("/slot-2"));
    }

    #[test]
    fn test_attempt_numbers_strictly_increase() {
        let first = AttemptNumber::first();
        let second = first.next();
        assert!(second > first);
        assert_eq!(second, AttemptNumber(1));
        assert_eq!(second.to_string(), "#1");
    }

    #[test]
    fn test_id_serde_roundtrip() {
        let id = JobMasterId::new();
        let json = serde_json::to_string(&id).unwrap();
        let restored: JobMasterId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, restored);
    }
}
