//! The job master: owns one job's execution.
//!
//! It runs only while it holds the leader fencing token; every RPC it
//! receives is checked against that token. The master exclusively owns its
//! slot pool, scheduler and checkpoint coordinator; they call back through
//! weak references so nothing outlives the master.

pub mod checkpoints;
pub mod execution_graph;
pub mod scheduler;
pub mod slot_pool;

use crate::jobmaster::checkpoints::CheckpointCoordinator;
use crate::jobmaster::execution_graph::ExecutionGraph;
use crate::jobmaster::scheduler::{FailoverStrategy, Scheduler};
use crate::jobmaster::slot_pool::SlotPool;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_checkpoint::{
    CheckpointId, CheckpointMetrics, CompletedCheckpoint, DeclineReason, TaskStateSnapshot,
};
use rivulet_core::config::RuntimeConfig;
use rivulet_core::executor::MainThreadExecutor;
use rivulet_core::gateway::{
    check_fencing_token, Ack, AccumulatorReport, JobMasterGateway, RegistrationResponse,
    ResourceManagerGateway, SlotOffer, TaskExecutionStateTransition, TaskExecutorGateway,
    TaskExecutorResolver,
};
use rivulet_core::ha::HighAvailabilityServices;
use rivulet_core::heartbeat::{HeartbeatListener, HeartbeatSender, HeartbeatTarget};
use rivulet_core::ids::{
    AllocationId, ExecutionAttemptId, JobId, JobMasterId, JobVertexId, ResourceId,
    ResourceManagerId,
};
use rivulet_core::jobgraph::JobGraph;
use rivulet_core::state::{ExecutionState, JobStatus};
use rivulet_core::{Result, RuntimeError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

struct TaskExecutorHeartbeatListener {
    job_master: Weak<JobMaster>,
}

impl HeartbeatListener<AccumulatorReport, ()> for TaskExecutorHeartbeatListener {
    fn report_payload(&self, _resource_id: ResourceId, _payload: AccumulatorReport) {}

    fn retrieve_payload(&self, _resource_id: ResourceId) {}

    fn notify_heartbeat_timeout(&self, resource_id: ResourceId) {
        if let Some(job_master) = self.job_master.upgrade() {
            tokio::spawn(async move {
                job_master
                    .on_task_executor_lost(resource_id, "heartbeat timeout")
                    .await;
            });
        }
    }
}

struct TaskExecutorHeartbeatTarget {
    gateway: Arc<dyn TaskExecutorGateway>,
}

#[async_trait]
impl HeartbeatTarget<()> for TaskExecutorHeartbeatTarget {
    async fn receive_heartbeat(&self, _origin: ResourceId, _payload: ()) {}

    async fn request_heartbeat(&self, origin: ResourceId, _payload: ()) {
        let _ = self.gateway.heartbeat_from_job_master(origin).await;
    }
}

/// One job's master.
pub struct JobMaster {
    job_id: JobId,
    job_name: String,
    address: String,
    config: RuntimeConfig,
    job_master_id: Mutex<Option<JobMasterId>>,
    status: Mutex<JobStatus>,
    graph: Mutex<ExecutionGraph>,
    /// Unassigned input splits per source vertex, handed out on request.
    input_splits: Mutex<HashMap<JobVertexId, VecDeque<Vec<u8>>>>,
    pool: Arc<SlotPool>,
    scheduler: Scheduler,
    coordinator: Arc<CheckpointCoordinator>,
    failover: Arc<dyn FailoverStrategy>,
    restarts: AtomicU32,
    task_executors: DashMap<ResourceId, (Arc<dyn TaskExecutorGateway>, String)>,
    te_resolver: Arc<dyn TaskExecutorResolver>,
    heartbeats: HeartbeatSender<AccumulatorReport, ()>,
    termination_tx: watch::Sender<Option<JobStatus>>,
    timers: Mutex<Vec<tokio::task::JoinHandle<()>>>,
    /// Serializes failover runs; concurrent failure reports for the same
    /// incident must not restart twice.
    failover_lock: tokio::sync::Mutex<()>,
    /// Back-reference for gateway handlers that must spawn failover work.
    self_ref: Weak<JobMaster>,
}

impl JobMaster {
    pub fn new(
        job_graph: JobGraph,
        address: impl Into<String>,
        config: RuntimeConfig,
        ha: &HighAvailabilityServices,
        te_resolver: Arc<dyn TaskExecutorResolver>,
        failover: Arc<dyn FailoverStrategy>,
    ) -> Result<Arc<Self>> {
        let graph = ExecutionGraph::new(job_graph)?;
        let job_id = graph.job_id;
        let job_name = graph.job_name.clone();
        let address = address.into();

        let pool = SlotPool::new(job_id, address.clone(), config.clone());
        let coordinator = Arc::new(CheckpointCoordinator::new(
            job_id,
            config.checkpoint.clone(),
            Arc::clone(&ha.checkpoint_id_counter),
            ha.checkpoint_storage(job_id),
        ));
        let (termination_tx, _) = watch::channel(None);
        let own_resource_id = ResourceId::new();
        let executor = MainThreadExecutor::new(format!("jobmaster-{job_id}"));
        let heartbeat_interval = config.heartbeat_interval();
        let heartbeat_timeout = config.heartbeat_timeout();

        Ok(Arc::new_cyclic(|weak: &Weak<JobMaster>| {
            let heartbeats = HeartbeatSender::new(
                own_resource_id,
                heartbeat_interval,
                heartbeat_timeout,
                Arc::new(TaskExecutorHeartbeatListener {
                    job_master: weak.clone(),
                }),
                executor,
            );
            JobMaster {
                job_id,
                job_name,
                address,
                scheduler: Scheduler::new(config.clone(), Arc::clone(&pool)),
                config,
                job_master_id: Mutex::new(None),
                status: Mutex::new(JobStatus::Created),
                graph: Mutex::new(graph),
                input_splits: Mutex::new(HashMap::new()),
                pool,
                coordinator,
                failover,
                restarts: AtomicU32::new(0),
                task_executors: DashMap::new(),
                te_resolver,
                heartbeats,
                termination_tx,
                timers: Mutex::new(Vec::new()),
                failover_lock: tokio::sync::Mutex::new(()),
                self_ref: weak.clone(),
            }
        }))
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn status(&self) -> JobStatus {
        *self.status.lock()
    }

    pub fn fencing_token(&self) -> Option<JobMasterId> {
        *self.job_master_id.lock()
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }

    pub fn coordinator(&self) -> &Arc<CheckpointCoordinator> {
        &self.coordinator
    }

    /// Completes once the job reaches a globally terminal status.
    pub fn termination_watch(&self) -> watch::Receiver<Option<JobStatus>> {
        self.termination_tx.subscribe()
    }

    /// Current attempt for a vertex index; test and harness surface.
    pub fn attempt_of(&self, index: usize) -> Option<ExecutionAttemptId> {
        self.graph.lock().vertex(index).map(|v| v.current_attempt)
    }

    /// Queue input splits for a source vertex; tasks pull them through
    /// `request_next_input_split`.
    pub fn add_input_splits(&self, vertex_id: JobVertexId, splits: Vec<Vec<u8>>) {
        self.input_splits
            .lock()
            .entry(vertex_id)
            .or_default()
            .extend(splits);
    }

    /// Begin running under `job_master_id` and start scheduling.
    pub async fn start(
        self: &Arc<Self>,
        job_master_id: JobMasterId,
        resource_manager_id: ResourceManagerId,
        resource_manager: Arc<dyn ResourceManagerGateway>,
    ) -> Result<()> {
        {
            let mut status = self.status.lock();
            if *status != JobStatus::Created && *status != JobStatus::Suspended {
                return Err(RuntimeError::other(format!(
                    "cannot start job master in status {status}"
                )));
            }
            *status = JobStatus::Running;
        }
        *self.job_master_id.lock() = Some(job_master_id);
        self.pool.start(job_master_id);
        self.pool
            .connect_to_resource_manager(resource_manager_id, resource_manager);
        info!(job = %self.job_id, token = %job_master_id, "job master started");

        self.spawn_timers();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let indices: Vec<usize> = (0..this.graph.lock().num_vertices()).collect();
            this.schedule_and_handle(indices, None).await;
        });
        Ok(())
    }

    /// Leadership lost: stop issuing fenced calls but keep state for a
    /// later restart.
    pub fn suspend(&self, cause: &str) {
        info!(job = %self.job_id, cause, "job master suspended");
        *self.job_master_id.lock() = None;
        *self.status.lock() = JobStatus::Suspended;
        self.stop_timers();
        self.pool.disconnect_resource_manager();
    }

    pub async fn cancel(&self) -> Result<()> {
        info!(job = %self.job_id, "canceling job");
        let cancellations: Vec<(ExecutionAttemptId, Arc<dyn TaskExecutorGateway>)> = {
            let graph = self.graph.lock();
            graph
                .vertices()
                .iter()
                .filter(|v| !v.state.is_terminal())
                .filter_map(|v| {
                    let gateway = v
                        .assigned_resource
                        .and_then(|r| self.task_executors.get(&r).map(|e| Arc::clone(&e.0)))?;
                    Some((v.current_attempt, gateway))
                })
                .collect()
        };
        for (attempt, gateway) in cancellations {
            if let Err(e) = gateway.cancel_task(attempt).await {
                warn!(attempt = %attempt, "cancel rpc failed: {e}");
            }
        }
        self.finish_job(JobStatus::Canceled);
        Ok(())
    }

    /// Trigger an out-of-band checkpoint and report the savepoint path.
    pub async fn trigger_savepoint(&self, target_directory: &str, cancel_job: bool) -> Result<String> {
        let expected = {
            let graph = self.graph.lock();
            graph
                .vertices()
                .iter()
                .map(|v| v.current_attempt)
                .collect()
        };
        let barrier = self.coordinator.trigger_checkpoint(expected).await?;
        self.send_barrier_to_sources(barrier).await;
        let path = format!("{target_directory}/savepoint-{}", barrier.id);
        if cancel_job {
            self.cancel().await?;
        }
        Ok(path)
    }

    fn spawn_timers(self: &Arc<Self>) {
        let mut timers = self.timers.lock();

        let weak = Arc::downgrade(self);
        let maintenance_interval = self.config.heartbeat_interval().min(self.config.idle_slot_timeout() / 2);
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(maintenance_interval.max(std::time::Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { return };
                if this.status().is_globally_terminal() {
                    return;
                }
                this.run_maintenance().await;
            }
        }));

        let weak = Arc::downgrade(self);
        let checkpoint_interval = self.config.checkpoint.interval();
        timers.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(checkpoint_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so checkpointing
            // starts one interval after the job does.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(this) = weak.upgrade() else { return };
                if this.status().is_globally_terminal() {
                    return;
                }
                this.maybe_trigger_checkpoint().await;
            }
        }));
    }

    fn stop_timers(&self) {
        for timer in self.timers.lock().drain(..) {
            timer.abort();
        }
    }

    async fn run_maintenance(self: &Arc<Self>) {
        // Idle slots go back to their workers.
        for slot in self.pool.check_idle_slots() {
            if let Some(entry) = self.task_executors.get(&slot.resource_id()) {
                let gateway = Arc::clone(&entry.0);
                let allocation_id = slot.allocation_id;
                tokio::spawn(async move {
                    let _ = gateway
                        .free_slot(allocation_id, "slot idle timeout".to_string())
                        .await;
                });
            }
        }
        self.pool.check_batch_slot_timeout();
        for checkpoint_id in self.coordinator.check_expired() {
            self.broadcast_abort(checkpoint_id, DeclineReason::Expired).await;
        }
    }

    async fn maybe_trigger_checkpoint(self: &Arc<Self>) {
        let all_running = {
            let graph = self.graph.lock();
            graph
                .vertices()
                .iter()
                .all(|v| v.state == ExecutionState::Running)
        };
        if !all_running {
            debug!(job = %self.job_id, "skipping checkpoint trigger: not all tasks running");
            return;
        }
        let expected = {
            let graph = self.graph.lock();
            graph.vertices().iter().map(|v| v.current_attempt).collect()
        };
        match self.coordinator.trigger_checkpoint(expected).await {
            Ok(barrier) => self.send_barrier_to_sources(barrier).await,
            Err(e) => debug!(job = %self.job_id, "checkpoint not triggered: {e}"),
        }
    }

    async fn send_barrier_to_sources(&self, barrier: rivulet_checkpoint::CheckpointBarrier) {
        let sources: Vec<(ExecutionAttemptId, Arc<dyn TaskExecutorGateway>)> = {
            let graph = self.graph.lock();
            graph
                .source_indices()
                .into_iter()
                .filter_map(|i| {
                    let vertex = graph.vertex(i)?;
                    let gateway = vertex
                        .assigned_resource
                        .and_then(|r| self.task_executors.get(&r).map(|e| Arc::clone(&e.0)))?;
                    Some((vertex.current_attempt, gateway))
                })
                .collect()
        };
        for (attempt, gateway) in sources {
            if let Err(e) = gateway.trigger_checkpoint(attempt, barrier).await {
                warn!(attempt = %attempt, "barrier injection failed: {e}");
            }
        }
    }

    async fn broadcast_complete(&self, checkpoint_id: CheckpointId) {
        for (attempt, gateway) in self.all_deployed_attempts() {
            let _ = gateway.notify_checkpoint_complete(attempt, checkpoint_id).await;
        }
    }

    async fn broadcast_abort(&self, checkpoint_id: CheckpointId, reason: DeclineReason) {
        for (attempt, gateway) in self.all_deployed_attempts() {
            let _ = gateway
                .notify_checkpoint_abort(attempt, checkpoint_id, reason)
                .await;
        }
    }

    fn all_deployed_attempts(&self) -> Vec<(ExecutionAttemptId, Arc<dyn TaskExecutorGateway>)> {
        let graph = self.graph.lock();
        graph
            .vertices()
            .iter()
            .filter(|v| !v.state.is_terminal())
            .filter_map(|v| {
                let gateway = v
                    .assigned_resource
                    .and_then(|r| self.task_executors.get(&r).map(|e| Arc::clone(&e.0)))?;
                Some((v.current_attempt, gateway))
            })
            .collect()
    }

    async fn schedule_and_handle(
        self: &Arc<Self>,
        indices: Vec<usize>,
        restore: Option<CompletedCheckpoint>,
    ) {
        let Some(token) = self.fencing_token() else {
            return;
        };
        if let Err(e) = self
            .scheduler
            .schedule_vertices(token, &self.graph, &indices, &self.task_executors, restore.as_ref())
            .await
        {
            warn!(job = %self.job_id, "scheduling failed: {e}");
            match self.first_failed_of(&indices) {
                Some(index) => self.spawn_failover(index, e.to_string()),
                None => self.fail_job(&e.to_string()),
            }
        }
    }

    fn first_failed_of(&self, indices: &[usize]) -> Option<usize> {
        let graph = self.graph.lock();
        indices
            .iter()
            .copied()
            .find(|&i| graph.vertex(i).map(|v| v.state) == Some(ExecutionState::Failed))
    }

    /// Hand a task failure to the failover loop without blocking the caller.
    fn spawn_failover(&self, failed_index: usize, cause: String) {
        if let Some(this) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                this.run_failover(failed_index, cause).await;
            });
        }
    }

    /// The failover loop: cancel, wait, reset, restore, redeploy; repeats
    /// while redeployment itself fails, until the restart budget runs out.
    async fn run_failover(self: Arc<Self>, mut failed_index: usize, mut cause: String) {
        let _guard = self.failover_lock.lock().await;
        // A failover that ran while this one waited may already have
        // recovered the vertex.
        {
            let graph = self.graph.lock();
            if graph.vertex(failed_index).map(|v| v.state) != Some(ExecutionState::Failed) {
                return;
            }
        }
        loop {
            if self.status().is_globally_terminal() {
                return;
            }
            let attempt_count = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt_count > self.config.max_restarts {
                self.fail_job(&format!(
                    "giving up after {attempt_count} restarts, last cause: {cause}"
                ));
                return;
            }

            let to_restart = {
                let graph = self.graph.lock();
                self.failover.vertices_to_restart(&graph, failed_index)
            };
            info!(
                job = %self.job_id,
                strategy = self.failover.name(),
                restarting = to_restart.len(),
                cause,
                "task failure, running failover"
            );

            // Cancel still-deployed members of the restart set and give
            // their slots back to the pool for reuse.
            let cancellations: Vec<(
                ExecutionAttemptId,
                Option<Arc<dyn TaskExecutorGateway>>,
                Option<rivulet_core::ids::SlotRequestId>,
            )> = {
                let graph = self.graph.lock();
                to_restart
                    .iter()
                    .filter_map(|&i| graph.vertex(i))
                    .filter(|v| !v.state.is_terminal() && v.state != ExecutionState::Created)
                    .map(|v| {
                        let gateway = v
                            .assigned_resource
                            .and_then(|r| self.task_executors.get(&r).map(|e| Arc::clone(&e.0)));
                        (v.current_attempt, gateway, v.assigned_request)
                    })
                    .collect()
            };
            for (attempt, gateway, request) in cancellations {
                if let Some(gateway) = gateway {
                    let _ = gateway.cancel_task(attempt).await;
                }
                if let Some(request) = request {
                    self.pool.release_slot(request, "failover restart");
                }
            }

            tokio::time::sleep(self.config.restart_delay()).await;
            if self.status().is_globally_terminal() {
                return;
            }

            self.graph.lock().reset_vertices(&to_restart);
            let restore = match self.coordinator.restore_latest().await {
                Ok(restore) => restore,
                Err(e) => {
                    warn!(job = %self.job_id, "restore lookup failed: {e}");
                    None
                }
            };
            if let Some(checkpoint) = &restore {
                info!(
                    job = %self.job_id,
                    checkpoint = %checkpoint.checkpoint_id,
                    "restoring from checkpoint"
                );
            }

            let Some(token) = self.fencing_token() else {
                return;
            };
            match self
                .scheduler
                .schedule_vertices(
                    token,
                    &self.graph,
                    &to_restart,
                    &self.task_executors,
                    restore.as_ref(),
                )
                .await
            {
                Ok(()) => return,
                Err(e) => {
                    warn!(job = %self.job_id, "redeployment failed: {e}");
                    match self.first_failed_of(&to_restart) {
                        Some(index) => {
                            failed_index = index;
                            cause = e.to_string();
                        }
                        None => {
                            self.fail_job(&e.to_string());
                            return;
                        }
                    }
                }
            }
        }
    }

    fn fail_job(&self, cause: &str) {
        warn!(job = %self.job_id, cause, "job failed");
        self.finish_job(JobStatus::Failed);
    }

    fn finish_job(&self, status: JobStatus) {
        {
            let mut current = self.status.lock();
            if current.is_globally_terminal() {
                return;
            }
            *current = status;
        }
        info!(job = %self.job_id, %status, "job reached terminal status");
        self.stop_timers();
        self.heartbeats.stop();

        // Give every slot back to its worker.
        for slot in self.pool.release_all() {
            if let Some(entry) = self.task_executors.get(&slot.resource_id()) {
                let gateway = Arc::clone(&entry.0);
                tokio::spawn(async move {
                    let _ = gateway
                        .free_slot(slot.allocation_id, "job terminated".to_string())
                        .await;
                });
            }
        }

        let _ = self.termination_tx.send(Some(status));
    }

    async fn on_task_executor_lost(self: &Arc<Self>, resource_id: ResourceId, cause: &str) {
        warn!(job = %self.job_id, worker = %resource_id, cause, "task executor lost");
        self.heartbeats.unmonitor_target(resource_id);
        self.task_executors.remove(&resource_id);
        self.pool.release_task_manager(resource_id, cause);

        let lost: Vec<usize> = {
            let mut graph = self.graph.lock();
            let lost = graph.vertices_on(resource_id);
            for &index in &lost {
                graph.mark_state(index, ExecutionState::Failed);
            }
            lost
        };
        if let Some(&first) = lost.first() {
            self.spawn_failover(first, cause.to_string());
        }
    }

    fn check_token(&self, received: &JobMasterId) -> Result<()> {
        let current = self.job_master_id.lock();
        check_fencing_token(current.as_ref(), received)
    }
}

#[async_trait]
impl JobMasterGateway for JobMaster {
    async fn register_task_manager(
        &self,
        job_master_id: JobMasterId,
        resource_id: ResourceId,
        address: String,
    ) -> Result<RegistrationResponse> {
        self.check_token(&job_master_id)?;
        let Some(gateway) = self.te_resolver.resolve_task_executor(&address) else {
            return Ok(RegistrationResponse::Rejection {
                reason: format!("cannot resolve task executor at {address}"),
            });
        };
        self.task_executors
            .insert(resource_id, (Arc::clone(&gateway), address));
        self.pool.register_task_manager(resource_id);
        self.heartbeats.monitor_target(
            resource_id,
            Arc::new(TaskExecutorHeartbeatTarget { gateway }),
        );
        debug!(job = %self.job_id, worker = %resource_id, "task manager registered");
        Ok(RegistrationResponse::Success {
            registration_id: rivulet_core::ids::RegistrationId::new(),
        })
    }

    async fn offer_slots(
        &self,
        job_master_id: JobMasterId,
        resource_id: ResourceId,
        offers: Vec<SlotOffer>,
    ) -> Result<Vec<SlotOffer>> {
        self.check_token(&job_master_id)?;
        Ok(self.pool.offer_slots(resource_id, offers))
    }

    async fn fail_slot(
        &self,
        job_master_id: JobMasterId,
        _resource_id: ResourceId,
        allocation_id: AllocationId,
        cause: String,
    ) -> Result<Ack> {
        self.check_token(&job_master_id)?;
        self.pool.fail_allocation(allocation_id, &cause);

        let failed_index = {
            let mut graph = self.graph.lock();
            let index = graph
                .vertices()
                .iter()
                .position(|v| v.assigned_allocation == Some(allocation_id) && !v.state.is_terminal());
            if let Some(index) = index {
                graph.mark_state(index, ExecutionState::Failed);
            }
            index
        };
        if let Some(index) = failed_index {
            self.spawn_failover(index, cause);
        }
        Ok(Ack)
    }

    async fn update_task_execution_state(
        &self,
        job_master_id: JobMasterId,
        transition: TaskExecutionStateTransition,
    ) -> Result<Ack> {
        self.check_token(&job_master_id)?;
        let (changed, index) = {
            let mut graph = self.graph.lock();
            let changed = graph.update_state(
                transition.execution_attempt_id,
                transition.state,
                transition.error.clone(),
            )?;
            (changed, graph.index_of_attempt(transition.execution_attempt_id))
        };
        if !changed {
            return Err(RuntimeError::other(format!(
                "unknown execution attempt {}",
                transition.execution_attempt_id
            )));
        }

        match transition.state {
            ExecutionState::Finished => {
                // Give the slot back; the pool reuses it or lets it idle out.
                let (request, all_finished) = {
                    let graph = self.graph.lock();
                    let request = index
                        .and_then(|i| graph.vertex(i))
                        .and_then(|v| v.assigned_request);
                    (request, graph.all_finished())
                };
                if let Some(request) = request {
                    self.pool.release_slot(request, "task finished");
                }
                if all_finished {
                    self.finish_job(JobStatus::Finished);
                }
            }
            ExecutionState::Failed => {
                let cause = transition
                    .error
                    .unwrap_or_else(|| "task failed".to_string());
                if let Some(index) = index {
                    self.spawn_failover(index, cause);
                }
            }
            _ => {}
        }
        Ok(Ack)
    }

    async fn request_next_input_split(
        &self,
        job_master_id: JobMasterId,
        vertex_id: JobVertexId,
        execution_attempt_id: ExecutionAttemptId,
    ) -> Result<Option<Vec<u8>>> {
        self.check_token(&job_master_id)?;
        if self.graph.lock().index_of_attempt(execution_attempt_id).is_none() {
            return Err(RuntimeError::other(format!(
                "unknown execution attempt {execution_attempt_id}"
            )));
        }
        Ok(self
            .input_splits
            .lock()
            .get_mut(&vertex_id)
            .and_then(|splits| splits.pop_front()))
    }

    async fn acknowledge_checkpoint(
        &self,
        job_id: JobId,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        metrics: CheckpointMetrics,
        state: TaskStateSnapshot,
    ) -> Result<Ack> {
        if job_id != self.job_id {
            return Err(RuntimeError::JobNotFound(job_id));
        }
        let subtask_index = {
            let graph = self.graph.lock();
            graph
                .index_of_attempt(execution_attempt_id)
                .and_then(|i| graph.vertex(i))
                .map(|v| v.execution_vertex_id.subtask_index)
        };
        let Some(subtask_index) = subtask_index else {
            return Ok(Ack);
        };
        if let Some(completed) = self
            .coordinator
            .receive_acknowledge(execution_attempt_id, subtask_index, checkpoint_id, metrics, state)
            .await?
        {
            self.broadcast_complete(completed.checkpoint_id).await;
        }
        Ok(Ack)
    }

    async fn decline_checkpoint(
        &self,
        job_id: JobId,
        execution_attempt_id: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> Result<Ack> {
        if job_id != self.job_id {
            return Err(RuntimeError::JobNotFound(job_id));
        }
        if self
            .coordinator
            .receive_decline(execution_attempt_id, checkpoint_id, reason)
        {
            self.broadcast_abort(checkpoint_id, reason).await;
        }
        Ok(Ack)
    }

    async fn heartbeat_from_task_manager(
        &self,
        resource_id: ResourceId,
        report: AccumulatorReport,
    ) -> Result<()> {
        self.heartbeats.receive_heartbeat(resource_id, report);
        Ok(())
    }

    async fn disconnect_task_manager(&self, resource_id: ResourceId, cause: String) -> Result<Ack> {
        // Same path as a heartbeat loss: release the worker and fail over
        // any executions it hosted.
        if let Some(this) = self.self_ref.upgrade() {
            tokio::spawn(async move {
                this.on_task_executor_lost(resource_id, &cause).await;
            });
        }
        Ok(Ack)
    }
}
