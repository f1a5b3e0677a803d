//! The execution graph: the job graph expanded to parallel subtasks, with
//! per-attempt state.

use rivulet_core::gateway::{
    ChannelLocation, InputChannelDescriptor, InputGateDescriptor, ResultPartitionDescriptor,
};
use rivulet_core::ids::{
    AllocationId, AttemptNumber, ExecutionAttemptId, ExecutionVertexId, JobId, JobVertexId,
    ResourceId, SlotRequestId,
};
use rivulet_core::jobgraph::{DistributionPattern, JobGraph};
use rivulet_core::resources::ResourceProfile;
use rivulet_core::state::ExecutionState;
use rivulet_core::{Result, RuntimeError};
use std::collections::HashMap;
use tracing::debug;

/// One parallel subtask of a job vertex, across its attempts.
pub struct ExecutionVertex {
    pub execution_vertex_id: ExecutionVertexId,
    pub task_name: String,
    pub resource_profile: ResourceProfile,
    pub task_configuration: serde_json::Value,
    pub is_source: bool,
    pub current_attempt: ExecutionAttemptId,
    pub attempt_number: AttemptNumber,
    pub state: ExecutionState,
    pub assigned_request: Option<SlotRequestId>,
    pub assigned_allocation: Option<AllocationId>,
    pub assigned_resource: Option<ResourceId>,
    pub failure_cause: Option<String>,
}

impl ExecutionVertex {
    /// Start a fresh attempt after failover. Attempt numbers strictly
    /// increase across resets.
    fn reset_for_new_attempt(&mut self) {
        self.current_attempt = ExecutionAttemptId::new();
        self.attempt_number = self.attempt_number.next();
        self.state = ExecutionState::Created;
        self.assigned_request = None;
        self.assigned_allocation = None;
        self.assigned_resource = None;
        self.failure_cause = None;
    }
}

/// The expanded graph the job master drives.
pub struct ExecutionGraph {
    pub job_id: JobId,
    pub job_name: String,
    graph: JobGraph,
    /// Topological order, each vertex expanded by its parallelism.
    vertices: Vec<ExecutionVertex>,
    attempt_index: HashMap<ExecutionAttemptId, usize>,
}

impl ExecutionGraph {
    pub fn new(graph: JobGraph) -> Result<Self> {
        graph.validate()?;
        let sources: Vec<JobVertexId> = graph.source_vertices().iter().map(|v| v.id).collect();

        let mut vertices = Vec::new();
        for job_vertex in graph.topological_order()? {
            for subtask in 0..job_vertex.parallelism {
                let attempt = ExecutionAttemptId::new();
                vertices.push(ExecutionVertex {
                    execution_vertex_id: ExecutionVertexId::new(job_vertex.id, subtask),
                    task_name: format!(
                        "{} ({}/{})",
                        job_vertex.name,
                        subtask + 1,
                        job_vertex.parallelism
                    ),
                    resource_profile: job_vertex.resource_profile.clone(),
                    task_configuration: job_vertex.task_configuration.clone(),
                    is_source: sources.contains(&job_vertex.id),
                    current_attempt: attempt,
                    attempt_number: AttemptNumber::first(),
                    state: ExecutionState::Created,
                    assigned_request: None,
                    assigned_allocation: None,
                    assigned_resource: None,
                    failure_cause: None,
                });
            }
        }
        let attempt_index = vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (v.current_attempt, i))
            .collect();
        Ok(Self {
            job_id: graph.job_id,
            job_name: graph.name.clone(),
            graph,
            vertices,
            attempt_index,
        })
    }

    pub fn job_graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn vertices(&self) -> &[ExecutionVertex] {
        &self.vertices
    }

    pub fn vertex(&self, index: usize) -> Option<&ExecutionVertex> {
        self.vertices.get(index)
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_of_attempt(&self, attempt: ExecutionAttemptId) -> Option<usize> {
        self.attempt_index.get(&attempt).copied()
    }

    pub fn assign_slot(
        &mut self,
        index: usize,
        slot_request_id: SlotRequestId,
        allocation_id: AllocationId,
        resource_id: ResourceId,
    ) {
        if let Some(vertex) = self.vertices.get_mut(index) {
            vertex.assigned_request = Some(slot_request_id);
            vertex.assigned_allocation = Some(allocation_id);
            vertex.assigned_resource = Some(resource_id);
        }
    }

    /// Apply a state transition, enforcing the lifecycle. Returns false for
    /// unknown attempts (stale reports from an old attempt).
    pub fn update_state(
        &mut self,
        attempt: ExecutionAttemptId,
        new_state: ExecutionState,
        error: Option<String>,
    ) -> Result<bool> {
        let Some(index) = self.index_of_attempt(attempt) else {
            return Ok(false);
        };
        let vertex = &mut self.vertices[index];
        if vertex.state == new_state {
            return Ok(true);
        }
        if !vertex.state.can_transition_to(new_state) {
            return Err(RuntimeError::other(format!(
                "illegal transition {} -> {} for {}",
                vertex.state, new_state, vertex.task_name
            )));
        }
        debug!(
            task = %vertex.task_name,
            from = %vertex.state,
            to = %new_state,
            "execution state transition"
        );
        vertex.state = new_state;
        vertex.failure_cause = error;
        Ok(true)
    }

    pub fn mark_state(&mut self, index: usize, state: ExecutionState) {
        if let Some(vertex) = self.vertices.get_mut(index) {
            vertex.state = state;
        }
    }

    /// Reset the given vertices for restart, minting new attempt ids.
    pub fn reset_vertices(&mut self, indices: &[usize]) {
        for &index in indices {
            if let Some(vertex) = self.vertices.get_mut(index) {
                self.attempt_index.remove(&vertex.current_attempt);
                vertex.reset_for_new_attempt();
                self.attempt_index.insert(vertex.current_attempt, index);
            }
        }
    }

    pub fn all_finished(&self) -> bool {
        self.vertices
            .iter()
            .all(|v| v.state == ExecutionState::Finished)
    }

    pub fn any_failed(&self) -> bool {
        self.vertices.iter().any(|v| v.state == ExecutionState::Failed)
    }

    pub fn running_attempts(&self) -> Vec<(usize, ExecutionAttemptId)> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.state == ExecutionState::Running)
            .map(|(i, v)| (i, v.current_attempt))
            .collect()
    }

    pub fn source_indices(&self) -> Vec<usize> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_source)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of vertices hosted by `resource_id`.
    pub fn vertices_on(&self, resource_id: ResourceId) -> Vec<usize> {
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.assigned_resource == Some(resource_id) && !v.state.is_terminal())
            .map(|(i, _)| i)
            .collect()
    }

    /// The failed vertex plus everything downstream of it, for partial
    /// restarts.
    pub fn downstream_closure(&self, index: usize) -> Vec<usize> {
        let Some(start) = self.vertices.get(index) else {
            return Vec::new();
        };
        let mut job_vertices = vec![start.execution_vertex_id.vertex_id];
        let mut i = 0;
        while i < job_vertices.len() {
            for edge in self.graph.outputs_of(job_vertices[i]) {
                if !job_vertices.contains(&edge.target) {
                    job_vertices.push(edge.target);
                }
            }
            i += 1;
        }
        self.vertices
            .iter()
            .enumerate()
            .filter(|(_, v)| job_vertices.contains(&v.execution_vertex_id.vertex_id))
            .map(|(i, _)| i)
            .collect()
    }

    /// Result partitions produced by the vertex at `index`: one partition
    /// per outgoing edge, subpartitioned for the consumer's parallelism.
    pub fn produced_partitions(&self, index: usize) -> Vec<ResultPartitionDescriptor> {
        let vertex = &self.vertices[index];
        let job_vertex_id = vertex.execution_vertex_id.vertex_id;
        self.graph
            .outputs_of(job_vertex_id)
            .iter()
            .enumerate()
            .map(|(edge_index, edge)| {
                let consumer_parallelism = self
                    .graph
                    .vertex(edge.target)
                    .map(|v| v.parallelism)
                    .unwrap_or(1);
                let num_subpartitions = match edge.pattern {
                    DistributionPattern::Pointwise => 1,
                    DistributionPattern::AllToAll => consumer_parallelism,
                };
                ResultPartitionDescriptor {
                    partition_index: edge_index as u32,
                    num_subpartitions,
                }
            })
            .collect()
    }

    /// Input gates consumed by the vertex at `index`: one gate per incoming
    /// edge. `locate` decides local versus remote per producing vertex.
    pub fn input_gates(
        &self,
        index: usize,
        locate: impl Fn(&ExecutionVertex) -> ChannelLocation,
    ) -> Vec<InputGateDescriptor> {
        let vertex = &self.vertices[index];
        let job_vertex_id = vertex.execution_vertex_id.vertex_id;
        let subtask = vertex.execution_vertex_id.subtask_index;

        self.graph
            .inputs_of(job_vertex_id)
            .iter()
            .enumerate()
            .map(|(gate_index, edge)| {
                // Which output slot of the producer feeds this edge.
                let producer_partition_index = self
                    .graph
                    .outputs_of(edge.source)
                    .iter()
                    .position(|e| e.target == job_vertex_id)
                    .unwrap_or(0) as u32;

                let producer_subtasks: Vec<&ExecutionVertex> = self
                    .vertices
                    .iter()
                    .filter(|v| v.execution_vertex_id.vertex_id == edge.source)
                    .collect();

                let channels = match edge.pattern {
                    DistributionPattern::Pointwise => producer_subtasks
                        .iter()
                        .filter(|p| p.execution_vertex_id.subtask_index == subtask)
                        .map(|p| InputChannelDescriptor {
                            producer_attempt: p.current_attempt,
                            producer_partition_index,
                            subpartition_index: 0,
                            location: locate(p),
                        })
                        .collect(),
                    DistributionPattern::AllToAll => producer_subtasks
                        .iter()
                        .map(|p| InputChannelDescriptor {
                            producer_attempt: p.current_attempt,
                            producer_partition_index,
                            subpartition_index: subtask,
                            location: locate(p),
                        })
                        .collect(),
                };

                InputGateDescriptor {
                    gate_index: gate_index as u32,
                    channels,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::jobgraph::{JobGraph, JobVertex};

    fn pipeline_graph() -> JobGraph {
        let mut graph = JobGraph::new("pipeline");
        let source = graph.add_vertex(JobVertex::new("source", 1, ResourceProfile::new(1.0, 64)));
        let sink = graph.add_vertex(JobVertex::new("sink", 1, ResourceProfile::new(1.0, 64)));
        graph.connect(source, sink, DistributionPattern::Pointwise);
        graph
    }

    #[test]
    fn test_expansion_respects_parallelism() {
        let mut graph = JobGraph::new("wide");
        let a = graph.add_vertex(JobVertex::new("a", 2, ResourceProfile::new(1.0, 64)));
        let b = graph.add_vertex(JobVertex::new("b", 3, ResourceProfile::new(1.0, 64)));
        graph.connect(a, b, DistributionPattern::AllToAll);

        let eg = ExecutionGraph::new(graph).unwrap();
        assert_eq!(eg.num_vertices(), 5);
        assert_eq!(eg.source_indices().len(), 2);
    }

    #[test]
    fn test_state_transitions_enforced() {
        let mut eg = ExecutionGraph::new(pipeline_graph()).unwrap();
        let attempt = eg.vertices()[0].current_attempt;

        eg.update_state(attempt, ExecutionState::Scheduled, None).unwrap();
        eg.update_state(attempt, ExecutionState::Deploying, None).unwrap();
        eg.update_state(attempt, ExecutionState::Running, None).unwrap();

        // Running -> Scheduled is illegal.
        assert!(eg
            .update_state(attempt, ExecutionState::Scheduled, None)
            .is_err());
    }

    #[test]
    fn test_stale_attempt_reports_are_ignored() {
        let mut eg = ExecutionGraph::new(pipeline_graph()).unwrap();
        let old_attempt = eg.vertices()[0].current_attempt;

        eg.reset_vertices(&[0]);
        let changed = eg
            .update_state(old_attempt, ExecutionState::Running, None)
            .unwrap();
        assert!(!changed);
        assert_eq!(eg.vertices()[0].attempt_number, AttemptNumber(1));
    }

    #[test]
    fn test_downstream_closure() {
        let eg = ExecutionGraph::new(pipeline_graph()).unwrap();
        // Source index 0 (topological order).
        let closure = eg.downstream_closure(0);
        assert_eq!(closure.len(), 2);
        let sink_only = eg.downstream_closure(1);
        assert_eq!(sink_only.len(), 1);
    }

    #[test]
    fn test_deployment_topology_descriptors() {
        let eg = ExecutionGraph::new(pipeline_graph()).unwrap();

        let produced = eg.produced_partitions(0);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0].num_subpartitions, 1);
        assert!(eg.produced_partitions(1).is_empty());

        let gates = eg.input_gates(1, |_| ChannelLocation::Local);
        assert_eq!(gates.len(), 1);
        assert_eq!(gates[0].channels.len(), 1);
        assert_eq!(
            gates[0].channels[0].producer_attempt,
            eg.vertices()[0].current_attempt
        );
    }
}
