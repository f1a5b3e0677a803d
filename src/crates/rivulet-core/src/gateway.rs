//! RPC gateway traits and their payload types.
//!
//! Every remote surface of the runtime is a capability trait here; the wire
//! transport behind it is an external collaborator and not specified. Fenced
//! surfaces take the caller's leader token as the first argument and reject
//! stale tokens with [`crate::RuntimeError::FencingTokenMismatch`].

use crate::ids::{
    AllocationId, ExecutionAttemptId, ExecutionVertexId, JobId, JobMasterId, JobVertexId,
    RegistrationId, ResourceId, ResourceManagerId, SlotId,
};
use crate::jobgraph::JobGraph;
use crate::resources::ResourceProfile;
use crate::state::{ApplicationStatus, ExecutionState, JobStatus};
use async_trait::async_trait;
use rivulet_checkpoint::{
    CheckpointBarrier, CheckpointId, CheckpointMetrics, DeclineReason, TaskStateSnapshot,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Positive acknowledgement of a fire-and-forget style RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack;

/// Outcome of a registration attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegistrationResponse {
    Success { registration_id: RegistrationId },
    Rejection { reason: String },
}

/// Status of one slot as reported by its owning task executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotStatus {
    pub slot_id: SlotId,
    pub resource_profile: ResourceProfile,
    /// Set when the slot is reserved for a job.
    pub allocation_id: Option<AllocationId>,
    pub job_id: Option<JobId>,
}

impl SlotStatus {
    pub fn is_free(&self) -> bool {
        self.allocation_id.is_none()
    }
}

/// Snapshot of all slots on one task executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SlotReport {
    pub slots: Vec<SlotStatus>,
}

impl SlotReport {
    pub fn new(slots: Vec<SlotStatus>) -> Self {
        Self { slots }
    }

    pub fn num_free(&self) -> usize {
        self.slots.iter().filter(|s| s.is_free()).count()
    }
}

/// One slot a task executor offers to a job master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotOffer {
    pub allocation_id: AllocationId,
    pub slot_index: u32,
    pub resource_profile: ResourceProfile,
}

/// A job master's slot demand, forwarded by its slot pool to the resource
/// manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRequestBody {
    pub job_id: JobId,
    pub allocation_id: AllocationId,
    pub resource_profile: ResourceProfile,
    pub job_master_address: String,
}

/// Registration payload of a task executor at the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutorRegistration {
    pub resource_id: ResourceId,
    pub address: String,
    /// Total resources across all declared slots.
    pub total_resource_profile: ResourceProfile,
    pub default_slot_profile: ResourceProfile,
    pub num_slots: u32,
}

/// Where one input channel finds its upstream subpartition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelLocation {
    /// Producer runs in the same process; consume the subpartition view
    /// directly.
    Local,
    /// Producer runs on another worker, reached over the data transport.
    Remote { address: String },
}

/// Descriptor of one result partition a deployed task produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPartitionDescriptor {
    pub partition_index: u32,
    pub num_subpartitions: u32,
}

/// Descriptor of one input gate a deployed task consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGateDescriptor {
    pub gate_index: u32,
    /// Producing attempt and location, one entry per channel.
    pub channels: Vec<InputChannelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputChannelDescriptor {
    pub producer_attempt: ExecutionAttemptId,
    pub producer_partition_index: u32,
    pub subpartition_index: u32,
    pub location: ChannelLocation,
}

/// State a restarted task resumes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRestore {
    pub checkpoint_id: CheckpointId,
    pub state: TaskStateSnapshot,
}

/// Everything a task executor needs to instantiate one task execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDeploymentDescriptor {
    pub job_id: JobId,
    pub execution_attempt_id: ExecutionAttemptId,
    pub vertex_id: ExecutionVertexId,
    pub task_name: String,
    pub allocation_id: AllocationId,
    /// Serialized task configuration, opaque to the control plane.
    pub task_configuration: serde_json::Value,
    pub restore: Option<TaskRestore>,
    pub produced_partitions: Vec<ResultPartitionDescriptor>,
    pub input_gates: Vec<InputGateDescriptor>,
}

/// A task execution state transition reported to the job master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExecutionStateTransition {
    pub execution_attempt_id: ExecutionAttemptId,
    pub state: ExecutionState,
    pub error: Option<String>,
    #[serde(default)]
    pub accumulators: HashMap<String, i64>,
}

/// Heartbeat payload a task executor sends its job master.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccumulatorReport {
    pub accumulators: HashMap<ExecutionAttemptId, HashMap<String, i64>>,
}

/// Summary of one job, served for completed jobs from the archived store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedExecutionGraph {
    pub job_id: JobId,
    pub name: String,
    pub status: JobStatus,
    pub failure_cause: Option<String>,
    /// Epoch milliseconds of the terminal transition.
    pub finished_at: i64,
}

/// Client- and recovery-facing surface of the dispatcher.
#[async_trait]
pub trait DispatcherGateway: Send + Sync {
    async fn submit_job(&self, job_graph: JobGraph) -> crate::Result<Ack>;
    async fn cancel_job(&self, job_id: JobId) -> crate::Result<Ack>;
    async fn list_jobs(&self) -> crate::Result<Vec<JobId>>;
    async fn request_job_status(&self, job_id: JobId) -> crate::Result<JobStatus>;
    async fn request_job_result(&self, job_id: JobId) -> crate::Result<ArchivedExecutionGraph>;
    async fn trigger_savepoint(
        &self,
        job_id: JobId,
        target_directory: String,
        cancel_job: bool,
    ) -> crate::Result<String>;
    async fn shut_down_cluster(&self, status: ApplicationStatus) -> crate::Result<Ack>;
}

/// Worker- and job-master-facing surface of the resource manager. Fenced by
/// [`ResourceManagerId`].
#[async_trait]
pub trait ResourceManagerGateway: Send + Sync {
    async fn register_task_executor(
        &self,
        resource_manager_id: ResourceManagerId,
        registration: TaskExecutorRegistration,
    ) -> crate::Result<RegistrationResponse>;

    async fn send_slot_report(
        &self,
        resource_manager_id: ResourceManagerId,
        resource_id: ResourceId,
        registration_id: RegistrationId,
        slot_report: SlotReport,
    ) -> crate::Result<Ack>;

    async fn request_slot(
        &self,
        resource_manager_id: ResourceManagerId,
        job_master_id: JobMasterId,
        request: SlotRequestBody,
    ) -> crate::Result<Ack>;

    async fn cancel_slot_request(
        &self,
        resource_manager_id: ResourceManagerId,
        allocation_id: AllocationId,
    ) -> crate::Result<Ack>;

    async fn disconnect_task_executor(
        &self,
        resource_id: ResourceId,
        cause: String,
    ) -> crate::Result<Ack>;

    async fn heartbeat_from_task_executor(
        &self,
        resource_id: ResourceId,
        slot_report: SlotReport,
    ) -> crate::Result<()>;

    async fn heartbeat_from_job_master(&self, resource_id: ResourceId) -> crate::Result<()>;
}

/// Worker-facing surface of a job master. Fenced by [`JobMasterId`].
#[async_trait]
pub trait JobMasterGateway: Send + Sync {
    async fn register_task_manager(
        &self,
        job_master_id: JobMasterId,
        resource_id: ResourceId,
        address: String,
    ) -> crate::Result<RegistrationResponse>;

    /// Returns the accepted subset of the offers.
    async fn offer_slots(
        &self,
        job_master_id: JobMasterId,
        resource_id: ResourceId,
        offers: Vec<SlotOffer>,
    ) -> crate::Result<Vec<SlotOffer>>;

    async fn fail_slot(
        &self,
        job_master_id: JobMasterId,
        resource_id: ResourceId,
        allocation_id: AllocationId,
        cause: String,
    ) -> crate::Result<Ack>;

    async fn update_task_execution_state(
        &self,
        job_master_id: JobMasterId,
        transition: TaskExecutionStateTransition,
    ) -> crate::Result<Ack>;

    /// Next serialized input split for a source vertex, or `None` when its
    /// splits are exhausted.
    async fn request_next_input_split(
        &self,
        job_master_id: JobMasterId,
        vertex_id: JobVertexId,
        execution_attempt_id: ExecutionAttemptId,
    ) -> crate::Result<Option<Vec<u8>>>;

    async fn acknowledge_checkpoint(
        &self,
        job_id: JobId,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
        state: TaskStateSnapshot,
    ) -> crate::Result<Ack>;

    async fn decline_checkpoint(
        &self,
        job_id: JobId,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> crate::Result<Ack>;

    async fn heartbeat_from_task_manager(
        &self,
        resource_id: ResourceId,
        report: AccumulatorReport,
    ) -> crate::Result<()>;

    async fn disconnect_task_manager(
        &self,
        resource_id: ResourceId,
        cause: String,
    ) -> crate::Result<Ack>;
}

/// Master-facing surface of a task executor.
#[async_trait]
pub trait TaskExecutorGateway: Send + Sync {
    /// Reserve a slot for `allocation_id` and offer it to the job master at
    /// `job_master_address`.
    async fn request_slot(
        &self,
        resource_manager_id: ResourceManagerId,
        slot_id: SlotId,
        job_id: JobId,
        allocation_id: AllocationId,
        resource_profile: ResourceProfile,
        job_master_address: String,
    ) -> crate::Result<Ack>;

    async fn submit_task(
        &self,
        job_master_id: JobMasterId,
        descriptor: TaskDeploymentDescriptor,
    ) -> crate::Result<Ack>;

    async fn cancel_task(&self, execution_attempt_id: ExecutionAttemptId) -> crate::Result<Ack>;

    async fn free_slot(&self, allocation_id: AllocationId, cause: String) -> crate::Result<Ack>;

    async fn trigger_checkpoint(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        barrier: CheckpointBarrier,
    ) -> crate::Result<Ack>;

    async fn notify_checkpoint_complete(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    ) -> crate::Result<Ack>;

    async fn notify_checkpoint_abort(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> crate::Result<Ack>;

    async fn heartbeat_from_resource_manager(&self, origin: ResourceId) -> crate::Result<()>;

    async fn heartbeat_from_job_master(&self, origin: ResourceId) -> crate::Result<()>;

    async fn disconnect_resource_manager(&self, cause: String) -> crate::Result<()>;

    fn address(&self) -> String;
}

/// Resolves a job master address carried in slot requests to a live gateway
/// and its current fencing token.
pub trait JobMasterResolver: Send + Sync {
    fn resolve_job_master(&self, address: &str)
        -> Option<(JobMasterId, Arc<dyn JobMasterGateway>)>;
}

/// Resolves a task executor address from a registration to a live gateway.
pub trait TaskExecutorResolver: Send + Sync {
    fn resolve_task_executor(&self, address: &str) -> Option<Arc<dyn TaskExecutorGateway>>;
}

/// The standalone in-process transport: a directory from advertised address
/// to gateway. Remote deployments replace this with a real RPC transport;
/// everything above it only sees the resolver traits.
#[derive(Default)]
pub struct RpcRegistry {
    job_masters: RwLock<HashMap<String, (JobMasterId, Arc<dyn JobMasterGateway>)>>,
    task_executors: RwLock<HashMap<String, Arc<dyn TaskExecutorGateway>>>,
}

impl RpcRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re-)register a job master under its address; a new fencing token
    /// replaces the old entry.
    pub fn register_job_master(
        &self,
        address: impl Into<String>,
        job_master_id: JobMasterId,
        gateway: Arc<dyn JobMasterGateway>,
    ) {
        self.job_masters
            .write()
            .insert(address.into(), (job_master_id, gateway));
    }

    pub fn unregister_job_master(&self, address: &str) {
        self.job_masters.write().remove(address);
    }

    pub fn register_task_executor(
        &self,
        address: impl Into<String>,
        gateway: Arc<dyn TaskExecutorGateway>,
    ) {
        self.task_executors.write().insert(address.into(), gateway);
    }

    pub fn unregister_task_executor(&self, address: &str) {
        self.task_executors.write().remove(address);
    }
}

impl JobMasterResolver for RpcRegistry {
    fn resolve_job_master(
        &self,
        address: &str,
    ) -> Option<(JobMasterId, Arc<dyn JobMasterGateway>)> {
        self.job_masters
            .read()
            .get(address)
            .map(|(id, gw)| (*id, Arc::clone(gw)))
    }
}

impl TaskExecutorResolver for RpcRegistry {
    fn resolve_task_executor(&self, address: &str) -> Option<Arc<dyn TaskExecutorGateway>> {
        self.task_executors.read().get(address).map(Arc::clone)
    }
}

/// Fencing check shared by all fenced endpoints.
pub fn check_fencing_token<T: PartialEq + std::fmt::Display>(
    expected: Option<&T>,
    received: &T,
) -> crate::Result<()> {
    match expected {
        Some(expected) if expected == received => Ok(()),
        Some(expected) => Err(crate::RuntimeError::FencingTokenMismatch {
            expected: expected.to_string(),
            received: received.to_string(),
        }),
        None => Err(crate::RuntimeError::FencingTokenMismatch {
            expected: "<no leadership>".to_string(),
            received: received.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fencing_accepts_current_token() {
        let token = JobMasterId::new();
        assert!(check_fencing_token(Some(&token), &token).is_ok());
    }

    #[test]
    fn test_fencing_rejects_stale_token() {
        let current = JobMasterId::new();
        let stale = JobMasterId::new();
        assert!(matches!(
            check_fencing_token(Some(&current), &stale),
            Err(crate::RuntimeError::FencingTokenMismatch { .. })
        ));
    }

    #[test]
    fn test_fencing_rejects_without_leadership() {
        let token = JobMasterId::new();
        assert!(check_fencing_token::<JobMasterId>(None, &token).is_err());
    }

    #[test]
    fn test_slot_report_counts_free_slots() {
        let resource_id = ResourceId::new();
        let report = SlotReport::new(vec![
            SlotStatus {
                slot_id: SlotId::new(resource_id, 0),
                resource_profile: ResourceProfile::new(1.0, 256),
                allocation_id: Some(AllocationId::new()),
                job_id: Some(JobId::new()),
            },
            SlotStatus {
                slot_id: SlotId::new(resource_id, 1),
                resource_profile: ResourceProfile::new(1.0, 256),
                allocation_id: None,
                job_id: None,
            },
        ]);
        assert_eq!(report.num_free(), 1);
    }
}
