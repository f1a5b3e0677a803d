//! The task executor: the worker process's control surface.
//!
//! Publishes its slots to the resource manager, reserves them on request and
//! offers them to the named job master, instantiates task executions with
//! their result partitions and input gates, and relays checkpoint control
//! between the coordinator and its tasks.

use crate::operator::OperatorChain;
use crate::slot_table::TaskSlotTable;
use crate::task::{StreamTask, StreamTaskSpec, TaskHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::InputChannelInfo;
use rivulet_checkpoint::{CheckpointBarrier, CheckpointId, DeclineReason};
use rivulet_core::config::RuntimeConfig;
use rivulet_core::gateway::{
    check_fencing_token, Ack, ChannelLocation, JobMasterGateway, JobMasterResolver,
    RegistrationResponse, ResourceManagerGateway, TaskDeploymentDescriptor, TaskExecutorGateway,
    TaskExecutorRegistration,
};
use rivulet_core::ids::{
    AllocationId, ExecutionAttemptId, JobId, JobMasterId, RegistrationId, ResourceId,
    ResourceManagerId, SlotId,
};
use rivulet_core::resources::ResourceProfile;
use rivulet_core::{Result, RuntimeError};
use rivulet_network::{
    bridge_remote, InputChannel, InputGate, NetworkBufferPool, PartitionMode, ResultPartition,
    ResultPartitionManager,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct RmConnection {
    resource_manager_id: ResourceManagerId,
    registration_id: RegistrationId,
    gateway: Arc<dyn ResourceManagerGateway>,
}

/// One worker process.
pub struct TaskExecutor {
    resource_id: ResourceId,
    address: String,
    config: RuntimeConfig,
    slot_table: Arc<TaskSlotTable>,
    partitions: Arc<ResultPartitionManager>,
    buffer_pool: Arc<NetworkBufferPool>,
    tasks: DashMap<ExecutionAttemptId, TaskHandle>,
    job_masters: DashMap<JobId, (JobMasterId, Arc<dyn JobMasterGateway>)>,
    rm: Mutex<Option<RmConnection>>,
    resolver: Arc<dyn JobMasterResolver>,
    /// Partition managers of peer workers, keyed by their data address.
    peers: DashMap<String, Arc<ResultPartitionManager>>,
}

impl TaskExecutor {
    pub fn new(
        address: impl Into<String>,
        num_slots: u32,
        default_profile: ResourceProfile,
        config: RuntimeConfig,
        resolver: Arc<dyn JobMasterResolver>,
    ) -> Arc<Self> {
        let resource_id = ResourceId::new();
        // The buffer budget follows the declared network memory; workers
        // without one get a per-channel fallback.
        let network_memory = default_profile
            .network_memory_bytes
            .saturating_mul(num_slots.max(1) as u64);
        let fallback_buffers =
            num_slots.max(1) as usize * config.network.buffers_per_channel * 8;
        let buffer_pool = Arc::new(NetworkBufferPool::from_budget(
            network_memory,
            config.network.buffer_size,
            fallback_buffers,
        ));
        Arc::new(Self {
            resource_id,
            address: address.into(),
            config,
            slot_table: Arc::new(TaskSlotTable::new(resource_id, num_slots, default_profile)),
            partitions: Arc::new(ResultPartitionManager::new()),
            buffer_pool,
            tasks: DashMap::new(),
            job_masters: DashMap::new(),
            rm: Mutex::new(None),
            resolver,
            peers: DashMap::new(),
        })
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn slot_table(&self) -> &Arc<TaskSlotTable> {
        &self.slot_table
    }

    pub fn partition_manager(&self) -> &Arc<ResultPartitionManager> {
        &self.partitions
    }

    pub fn buffer_pool(&self) -> &Arc<NetworkBufferPool> {
        &self.buffer_pool
    }

    pub fn hosts_task(&self, attempt_id: ExecutionAttemptId) -> bool {
        self.tasks.contains_key(&attempt_id)
    }

    /// Feed a record into a hosted source task. Test and harness surface.
    pub fn inject_record(&self, attempt_id: ExecutionAttemptId, record: bytes::Bytes) -> Result<()> {
        let task = self
            .tasks
            .get(&attempt_id)
            .ok_or_else(|| RuntimeError::other(format!("no task {attempt_id}")))?;
        task.inject_record(record);
        Ok(())
    }

    /// Signal a hosted source task that its input is exhausted.
    pub fn finish_source(&self, attempt_id: ExecutionAttemptId) -> Result<()> {
        let task = self
            .tasks
            .get(&attempt_id)
            .ok_or_else(|| RuntimeError::other(format!("no task {attempt_id}")))?;
        task.finish_input();
        Ok(())
    }

    /// Make another worker's partitions reachable under its data address.
    pub fn register_peer(&self, address: impl Into<String>, partitions: Arc<ResultPartitionManager>) {
        self.peers.insert(address.into(), partitions);
    }

    /// Register at the resource manager and send the initial slot report.
    pub async fn connect_to_resource_manager(
        self: &Arc<Self>,
        resource_manager_id: ResourceManagerId,
        gateway: Arc<dyn ResourceManagerGateway>,
    ) -> Result<()> {
        let registration = TaskExecutorRegistration {
            resource_id: self.resource_id,
            address: self.address.clone(),
            total_resource_profile: self.slot_table.total_profile(),
            default_slot_profile: self.slot_table.default_profile().clone(),
            num_slots: self.slot_table.num_slots(),
        };
        let response = gateway
            .register_task_executor(resource_manager_id, registration)
            .await?;
        let registration_id = match response {
            RegistrationResponse::Success { registration_id } => registration_id,
            RegistrationResponse::Rejection { reason } => {
                return Err(RuntimeError::Rpc(format!("registration rejected: {reason}")))
            }
        };
        info!(worker = %self.resource_id, "registered at resource manager");
        *self.rm.lock() = Some(RmConnection {
            resource_manager_id,
            registration_id,
            gateway: Arc::clone(&gateway),
        });
        self.send_slot_report().await
    }

    /// Report the current slot states to the resource manager.
    pub async fn send_slot_report(&self) -> Result<()> {
        let (rm_id, registration_id, gateway) = {
            let rm = self.rm.lock();
            let Some(conn) = rm.as_ref() else {
                return Err(RuntimeError::Rpc("not connected to a resource manager".into()));
            };
            (
                conn.resource_manager_id,
                conn.registration_id,
                Arc::clone(&conn.gateway),
            )
        };
        gateway
            .send_slot_report(rm_id, self.resource_id, registration_id, self.slot_table.slot_report())
            .await
            .map(|_| ())
    }

    /// Reclaim allocations no job master activated in time, then refresh the
    /// resource manager's view. Driven by a timer in `start_timers`.
    pub async fn check_slot_timeouts(&self) {
        let freed = self
            .slot_table
            .check_allocation_timeouts(self.config.idle_slot_timeout());
        if !freed.is_empty() {
            debug!(count = freed.len(), "reclaimed timed-out allocations");
            if let Err(e) = self.send_slot_report().await {
                warn!("slot report after timeout reclaim failed: {e}");
            }
        }
    }

    /// Periodic housekeeping loop.
    pub fn start_timers(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let period = this.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                this.check_slot_timeouts().await;
            }
        })
    }

    fn job_master_for(&self, job_id: JobId) -> Result<(JobMasterId, Arc<dyn JobMasterGateway>)> {
        self.job_masters
            .get(&job_id)
            .map(|e| (e.0, Arc::clone(&e.1)))
            .ok_or_else(|| RuntimeError::other(format!("no job master connection for {job_id}")))
    }

    fn build_gates(&self, descriptor: &TaskDeploymentDescriptor) -> Result<Vec<InputGate>> {
        let mut gates = Vec::new();
        for gate_descriptor in &descriptor.input_gates {
            let mut channels = Vec::new();
            for (channel_index, channel_descriptor) in gate_descriptor.channels.iter().enumerate() {
                let info = InputChannelInfo::new(gate_descriptor.gate_index, channel_index as u32);
                let channel = match &channel_descriptor.location {
                    ChannelLocation::Local => {
                        let partition = self
                            .partitions
                            .get(
                                channel_descriptor.producer_attempt,
                                channel_descriptor.producer_partition_index,
                            )
                            .map_err(|e| RuntimeError::other(e.to_string()))?;
                        let subpartition = partition
                            .subpartition(channel_descriptor.subpartition_index)
                            .map_err(|e| RuntimeError::other(e.to_string()))?;
                        InputChannel::local(info, subpartition)
                            .map_err(|e| RuntimeError::other(e.to_string()))?
                    }
                    ChannelLocation::Remote { address } => {
                        let peer = self.peers.get(address).map(|p| Arc::clone(&p)).ok_or_else(
                            || RuntimeError::other(format!("unknown peer address {address}")),
                        )?;
                        let partition = peer
                            .get(
                                channel_descriptor.producer_attempt,
                                channel_descriptor.producer_partition_index,
                            )
                            .map_err(|e| RuntimeError::other(e.to_string()))?;
                        let subpartition = partition
                            .subpartition(channel_descriptor.subpartition_index)
                            .map_err(|e| RuntimeError::other(e.to_string()))?;
                        let receiver =
                            bridge_remote(subpartition, self.config.network.initial_credit)
                                .map_err(|e| RuntimeError::other(e.to_string()))?;
                        InputChannel::remote(info, receiver)
                    }
                };
                channels.push(channel);
            }
            gates.push(InputGate::new(gate_descriptor.gate_index, channels));
        }
        Ok(gates)
    }
}

#[async_trait]
impl TaskExecutorGateway for TaskExecutor {
    async fn request_slot(
        &self,
        resource_manager_id: ResourceManagerId,
        slot_id: SlotId,
        job_id: JobId,
        allocation_id: AllocationId,
        resource_profile: ResourceProfile,
        job_master_address: String,
    ) -> Result<Ack> {
        {
            let rm = self.rm.lock();
            let expected = rm.as_ref().map(|c| c.resource_manager_id);
            check_fencing_token(expected.as_ref(), &resource_manager_id)?;
        }

        self.slot_table
            .allocate(slot_id.slot_index, job_id, allocation_id, resource_profile)?;

        let Some((job_master_id, job_master)) =
            self.resolver.resolve_job_master(&job_master_address)
        else {
            // Leave the slot ALLOCATED; the timeout reclaims it if the job
            // master never shows up.
            warn!(address = %job_master_address, "cannot resolve job master for slot offer");
            return Ok(Ack);
        };

        // First contact with this job master: register before offering, so
        // the offer is not rejected as coming from an unknown worker.
        if !self.job_masters.contains_key(&job_id) {
            match job_master
                .register_task_manager(job_master_id, self.resource_id, self.address.clone())
                .await?
            {
                RegistrationResponse::Success { .. } => {}
                RegistrationResponse::Rejection { reason } => {
                    return Err(RuntimeError::Rpc(format!(
                        "job master rejected registration: {reason}"
                    )));
                }
            }
        }

        // Record the connection before offering: an accepted offer may be
        // followed by a submission before this call even returns.
        self.job_masters
            .insert(job_id, (job_master_id, Arc::clone(&job_master)));

        let offer = rivulet_core::gateway::SlotOffer {
            allocation_id,
            slot_index: slot_id.slot_index,
            resource_profile: self
                .slot_table
                .slot_report()
                .slots
                .iter()
                .find(|s| s.allocation_id == Some(allocation_id))
                .map(|s| s.resource_profile.clone())
                .unwrap_or_default(),
        };
        let accepted = job_master
            .offer_slots(job_master_id, self.resource_id, vec![offer])
            .await?;

        if accepted.iter().any(|o| o.allocation_id == allocation_id) {
            // Activation may already have happened through a submission.
            self.slot_table.mark_active(allocation_id)?;
            debug!(allocation = %allocation_id, job = %job_id, "slot offer accepted");
        } else {
            debug!(allocation = %allocation_id, "slot offer rejected, freeing");
            let _ = self.slot_table.try_free(allocation_id, "offer rejected");
        }
        Ok(Ack)
    }

    async fn submit_task(
        &self,
        job_master_id: JobMasterId,
        descriptor: TaskDeploymentDescriptor,
    ) -> Result<Ack> {
        let (expected, job_master) = self.job_master_for(descriptor.job_id)?;
        check_fencing_token(Some(&expected), &job_master_id)?;

        // A submission is an implicit acceptance: the offer round trip may
        // still be in flight when the scheduler deploys.
        self.slot_table.mark_active(descriptor.allocation_id)?;
        self.slot_table
            .add_task(descriptor.allocation_id, descriptor.execution_attempt_id)?;

        // Producer side first, so downstream local channels can attach.
        let mut produced = Vec::new();
        for partition_descriptor in &descriptor.produced_partitions {
            let partition = Arc::new(ResultPartition::new(
                descriptor.execution_attempt_id,
                partition_descriptor.partition_index,
                partition_descriptor.num_subpartitions,
                PartitionMode::Pipelined,
            ));
            self.partitions.register(Arc::clone(&partition));
            produced.push(partition);
        }

        let gates = self.build_gates(&descriptor)?;
        let chain = OperatorChain::from_config(&descriptor.task_configuration);

        info!(
            task = %descriptor.task_name,
            attempt = %descriptor.execution_attempt_id,
            "submitting task"
        );
        let handle = StreamTask::spawn(StreamTaskSpec {
            job_id: descriptor.job_id,
            attempt_id: descriptor.execution_attempt_id,
            vertex_id: descriptor.vertex_id,
            name: descriptor.task_name.clone(),
            chain,
            gates,
            partitions: produced,
            buffer_pool: Arc::clone(&self.buffer_pool),
            restore: descriptor.restore.clone(),
            job_master,
            job_master_id,
        });
        self.tasks.insert(descriptor.execution_attempt_id, handle);
        Ok(Ack)
    }

    async fn cancel_task(&self, execution_attempt_id: ExecutionAttemptId) -> Result<Ack> {
        if let Some((_, handle)) = self.tasks.remove(&execution_attempt_id) {
            handle.cancel();
            self.partitions.release_partitions_of(execution_attempt_id);
            self.slot_table.remove_task(execution_attempt_id);
        }
        Ok(Ack)
    }

    async fn free_slot(&self, allocation_id: AllocationId, cause: String) -> Result<Ack> {
        for attempt in self.slot_table.tasks_of(allocation_id) {
            if let Some((_, handle)) = self.tasks.remove(&attempt) {
                handle.cancel();
            }
            self.partitions.release_partitions_of(attempt);
            self.slot_table.remove_task(attempt);
        }
        self.slot_table.try_free(allocation_id, &cause)?;
        if let Err(e) = self.send_slot_report().await {
            warn!("slot report after free failed: {e}");
        }
        Ok(Ack)
    }

    async fn trigger_checkpoint(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        barrier: CheckpointBarrier,
    ) -> Result<Ack> {
        let task = self
            .tasks
            .get(&execution_attempt_id)
            .ok_or_else(|| RuntimeError::other(format!("no task {execution_attempt_id}")))?;
        task.trigger_checkpoint(barrier);
        Ok(Ack)
    }

    async fn notify_checkpoint_complete(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
    ) -> Result<Ack> {
        if let Some(task) = self.tasks.get(&execution_attempt_id) {
            task.notify_checkpoint_complete(checkpoint_id);
        }
        Ok(Ack)
    }

    async fn notify_checkpoint_abort(
        &self,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> Result<Ack> {
        if let Some(task) = self.tasks.get(&execution_attempt_id) {
            task.notify_checkpoint_abort(checkpoint_id, reason);
        }
        Ok(Ack)
    }

    async fn heartbeat_from_resource_manager(&self, _origin: ResourceId) -> Result<()> {
        let (rm_gateway, report) = {
            let rm = self.rm.lock();
            match rm.as_ref() {
                Some(conn) => (Arc::clone(&conn.gateway), self.slot_table.slot_report()),
                None => return Ok(()),
            }
        };
        rm_gateway
            .heartbeat_from_task_executor(self.resource_id, report)
            .await
    }

    async fn heartbeat_from_job_master(&self, _origin: ResourceId) -> Result<()> {
        let gateways: Vec<Arc<dyn JobMasterGateway>> = self
            .job_masters
            .iter()
            .map(|entry| Arc::clone(&entry.value().1))
            .collect();
        for gateway in gateways {
            let _ = gateway
                .heartbeat_from_task_manager(self.resource_id, Default::default())
                .await;
        }
        Ok(())
    }

    async fn disconnect_resource_manager(&self, cause: String) -> Result<()> {
        info!(worker = %self.resource_id, cause, "disconnecting from resource manager");
        *self.rm.lock() = None;
        Ok(())
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoResolver;

    impl JobMasterResolver for NoResolver {
        fn resolve_job_master(
            &self,
            _address: &str,
        ) -> Option<(JobMasterId, Arc<dyn JobMasterGateway>)> {
            None
        }
    }

    fn executor() -> Arc<TaskExecutor> {
        TaskExecutor::new(
            "te-test:0",
            2,
            ResourceProfile::new(1.0, 256),
            RuntimeConfig::default(),
            Arc::new(NoResolver),
        )
    }

    #[tokio::test]
    async fn test_request_slot_requires_rm_connection() {
        let te = executor();
        let result = te
            .request_slot(
                ResourceManagerId::new(),
                SlotId::new(te.resource_id(), 0),
                JobId::new(),
                AllocationId::new(),
                ResourceProfile::new(1.0, 256),
                "jm".to_string(),
            )
            .await;
        assert!(matches!(
            result,
            Err(RuntimeError::FencingTokenMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_slot_report_reflects_table() {
        let te = executor();
        assert_eq!(te.slot_table().slot_report().num_free(), 2);
    }
}
