//! Shared runtime model for the rivulet cluster.
//!
//! Everything the master and worker processes agree on lives here: opaque
//! identifiers and fencing tokens, resource profiles, the job graph, the
//! RPC gateway traits of §external-interface fame, the single-threaded main
//! executor every component serializes its state mutations on, heartbeat
//! services, the high-availability service seam, and the runtime
//! configuration schema.

pub mod config;
pub mod error;
pub mod executor;
pub mod gateway;
pub mod ha;
pub mod heartbeat;
pub mod ids;
pub mod jobgraph;
pub mod metrics;
pub mod resources;
pub mod shutdown;
pub mod state;

pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use executor::MainThreadExecutor;
pub use ids::{
    AllocationId, AttemptNumber, ExecutionAttemptId, ExecutionVertexId, JobId, JobMasterId,
    JobVertexId, RegistrationId, ResourceId, ResourceManagerId, SlotId, SlotRequestId,
};
pub use jobgraph::{DistributionPattern, JobEdge, JobGraph, JobVertex};
pub use metrics::MetricRegistry;
pub use resources::{ResourceBudgetManager, ResourceProfile};
pub use shutdown::ShutdownCoordinator;
pub use state::{ApplicationStatus, ExecutionState, JobStatus, SlotState};

// Checkpoint identifiers are defined next to the snapshot machinery and
// re-exported here so most callers only import from core.
pub use rivulet_checkpoint::{CheckpointId, OperatorId};
