//! Eager scheduling and deployment of execution vertices.
//!
//! Phase 1 requests one slot per vertex from the slot pool and waits for all
//! of them; any failure marks the vertex FAILED and surfaces to the failover
//! path. Phase 2 deploys each vertex onto its worker with a full deployment
//! descriptor. A vertex only reaches RUNNING through the worker's own state
//! report.

use crate::jobmaster::execution_graph::ExecutionGraph;
use crate::jobmaster::slot_pool::{AllocatedSlot, SlotPool};
use dashmap::DashMap;
use parking_lot::Mutex;
use rivulet_checkpoint::{CompletedCheckpoint, OperatorId, TaskStateSnapshot};
use rivulet_core::config::RuntimeConfig;
use rivulet_core::gateway::{
    ChannelLocation, TaskDeploymentDescriptor, TaskExecutorGateway, TaskRestore,
};
use rivulet_core::ids::{ResourceId, SlotRequestId};
use rivulet_core::state::ExecutionState;
use rivulet_core::{Result, RuntimeError};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides which vertices restart after a task failure.
pub trait FailoverStrategy: Send + Sync {
    fn vertices_to_restart(&self, graph: &ExecutionGraph, failed_index: usize) -> Vec<usize>;

    fn name(&self) -> &'static str;
}

/// Global failover: restart the whole graph, restoring from the last
/// completed checkpoint.
pub struct RestartAllStrategy;

impl FailoverStrategy for RestartAllStrategy {
    fn vertices_to_restart(&self, graph: &ExecutionGraph, _failed_index: usize) -> Vec<usize> {
        (0..graph.num_vertices()).collect()
    }

    fn name(&self) -> &'static str {
        "restart-all"
    }
}

/// Partial failover: restart the failed vertex and everything downstream of
/// it.
pub struct RestartDownstreamStrategy;

impl FailoverStrategy for RestartDownstreamStrategy {
    fn vertices_to_restart(&self, graph: &ExecutionGraph, failed_index: usize) -> Vec<usize> {
        graph.downstream_closure(failed_index)
    }

    fn name(&self) -> &'static str {
        "restart-downstream"
    }
}

/// One vertex's slot future plus the bookkeeping to deploy it.
struct DeploymentHandle {
    index: usize,
    slot_request_id: SlotRequestId,
    future: crate::jobmaster::slot_pool::SlotFuture,
}

pub struct Scheduler {
    config: RuntimeConfig,
    pool: Arc<SlotPool>,
}

impl Scheduler {
    pub fn new(config: RuntimeConfig, pool: Arc<SlotPool>) -> Self {
        Self { config, pool }
    }

    /// Acquire slots for and deploy the given vertex indices (already in
    /// topological order). `restore` carries the checkpoint to resume from;
    /// `job_master_id` fences the deployments.
    pub async fn schedule_vertices(
        &self,
        job_master_id: rivulet_core::ids::JobMasterId,
        graph: &Mutex<ExecutionGraph>,
        indices: &[usize],
        task_executors: &DashMap<ResourceId, (Arc<dyn TaskExecutorGateway>, String)>,
        restore: Option<&CompletedCheckpoint>,
    ) -> Result<()> {
        // Phase 1: one slot request per vertex, with a soft locality
        // preference for the first upstream producer's worker.
        let mut handles = Vec::with_capacity(indices.len());
        {
            let mut graph = graph.lock();
            for &index in indices {
                let Some(vertex) = graph.vertex(index) else {
                    continue;
                };
                let profile = vertex.resource_profile.clone();
                let attempt = vertex.current_attempt;
                let preference = upstream_preference(&graph, index);
                let slot_request_id = SlotRequestId::new();
                debug!(task = %vertex.task_name, request = %slot_request_id, "requesting slot");
                let future = self.pool.request_new_allocated_slot(
                    slot_request_id,
                    profile,
                    preference,
                    self.config.slot_request_timeout(),
                );
                graph.update_state(attempt, ExecutionState::Scheduled, None)?;
                handles.push(DeploymentHandle {
                    index,
                    slot_request_id,
                    future,
                });
            }
        }

        // Wait for every slot before deploying anything.
        let mut assignments: Vec<(usize, SlotRequestId, AllocatedSlot)> = Vec::new();
        for handle in handles {
            match handle.future.await {
                Ok(Ok(slot)) => assignments.push((handle.index, handle.slot_request_id, slot)),
                Ok(Err(e)) => {
                    let mut graph = graph.lock();
                    graph.mark_state(handle.index, ExecutionState::Failed);
                    return Err(RuntimeError::AllocationFailure {
                        allocation_id: rivulet_core::ids::AllocationId::new(),
                        cause: format!("slot acquisition failed: {e}"),
                    });
                }
                Err(_) => {
                    graph.lock().mark_state(handle.index, ExecutionState::Failed);
                    return Err(RuntimeError::other("slot future dropped"));
                }
            }
        }

        // Phase 2a: record assignments so descriptor building sees every
        // producer's location.
        {
            let mut graph = graph.lock();
            for (index, slot_request_id, slot) in &assignments {
                graph.assign_slot(*index, *slot_request_id, slot.allocation_id, slot.resource_id());
            }
        }

        // Phase 2b: build descriptors and deploy.
        let mut deployments = Vec::with_capacity(assignments.len());
        {
            let graph = graph.lock();
            for (index, _, slot) in &assignments {
                let descriptor = build_descriptor(&graph, *index, slot, task_executors, restore)?;
                let gateway = task_executors
                    .get(&slot.resource_id())
                    .map(|e| Arc::clone(&e.0))
                    .ok_or_else(|| RuntimeError::UnknownTaskExecutor(slot.resource_id()))?;
                deployments.push((*index, descriptor, gateway));
            }
        }

        for (index, descriptor, gateway) in deployments {
            let attempt = descriptor.execution_attempt_id;
            info!(task = %descriptor.task_name, attempt = %attempt, "deploying");
            {
                let mut graph = graph.lock();
                graph.update_state(attempt, ExecutionState::Deploying, None)?;
            }
            if let Err(e) = gateway.submit_task(job_master_id, descriptor).await {
                warn!(attempt = %attempt, "deployment failed: {e}");
                let mut graph = graph.lock();
                graph.mark_state(index, ExecutionState::Failed);
                return Err(RuntimeError::TaskFailure(format!("deployment failed: {e}")));
            }
        }
        Ok(())
    }

    pub fn pool(&self) -> &Arc<SlotPool> {
        &self.pool
    }
}

/// Soft location preference: the worker of the first upstream producer that
/// already has an assignment.
fn upstream_preference(graph: &ExecutionGraph, index: usize) -> Option<ResourceId> {
    let vertex = graph.vertex(index)?;
    let job_vertex_id = vertex.execution_vertex_id.vertex_id;
    graph
        .job_graph()
        .inputs_of(job_vertex_id)
        .iter()
        .flat_map(|edge| {
            graph
                .vertices()
                .iter()
                .filter(move |v| v.execution_vertex_id.vertex_id == edge.source)
        })
        .find_map(|producer| producer.assigned_resource)
}

/// Extract the operator ids of a vertex's configured chain.
fn operator_ids_from_config(config: &serde_json::Value) -> Vec<OperatorId> {
    config
        .get("operators")
        .and_then(|v| v.as_array())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|e| e.get("id").and_then(|v| v.as_str()))
                .filter_map(|s| uuid::Uuid::parse_str(s).ok())
                .map(OperatorId::from_uuid)
                .collect()
        })
        .unwrap_or_default()
}

fn build_descriptor(
    graph: &ExecutionGraph,
    index: usize,
    slot: &AllocatedSlot,
    task_executors: &DashMap<ResourceId, (Arc<dyn TaskExecutorGateway>, String)>,
    restore: Option<&CompletedCheckpoint>,
) -> Result<TaskDeploymentDescriptor> {
    let vertex = graph
        .vertex(index)
        .ok_or_else(|| RuntimeError::other("vertex vanished during deployment"))?;

    let produced_partitions = graph.produced_partitions(index);
    let own_resource = slot.resource_id();
    let input_gates = graph.input_gates(index, |producer| {
        if producer.assigned_resource == Some(own_resource) {
            ChannelLocation::Local
        } else {
            let address = producer
                .assigned_resource
                .and_then(|r| task_executors.get(&r).map(|e| e.1.clone()))
                .unwrap_or_default();
            ChannelLocation::Remote { address }
        }
    });

    let restore = restore.and_then(|checkpoint| {
        let operator_ids = operator_ids_from_config(&vertex.task_configuration);
        let subtask = vertex.execution_vertex_id.subtask_index;
        let mut snapshot = TaskStateSnapshot::new();
        for operator_id in operator_ids {
            if let Some(operator_state) = checkpoint.operator_states.get(&operator_id) {
                if let Some(state) = operator_state.subtask_states.get(&subtask) {
                    snapshot.put_subtask_state(operator_id, state.clone());
                }
            }
        }
        (!snapshot.subtask_states.is_empty()).then(|| TaskRestore {
            checkpoint_id: checkpoint.checkpoint_id,
            state: snapshot,
        })
    });

    Ok(TaskDeploymentDescriptor {
        job_id: graph.job_id,
        execution_attempt_id: vertex.current_attempt,
        vertex_id: vertex.execution_vertex_id,
        task_name: vertex.task_name.clone(),
        allocation_id: slot.allocation_id,
        task_configuration: vertex.task_configuration.clone(),
        restore,
        produced_partitions,
        input_gates,
    })
}
