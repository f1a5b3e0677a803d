//! The logical job graph submitted by clients.
//!
//! Translation from user programs into this form happens outside the
//! runtime; the dispatcher only validates and persists what it receives.

use crate::error::{Result, RuntimeError};
use crate::ids::{JobId, JobVertexId};
use crate::resources::ResourceProfile;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

/// How a producing vertex's subtasks connect to a consuming vertex's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionPattern {
    /// Subtask i of the producer feeds subtask i of the consumer.
    Pointwise,
    /// Every producer subtask feeds every consumer subtask.
    AllToAll,
}

/// One directed edge of the job graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEdge {
    pub source: JobVertexId,
    pub target: JobVertexId,
    pub pattern: DistributionPattern,
}

/// One logical operator (chain) of the job graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVertex {
    pub id: JobVertexId,
    pub name: String,
    pub parallelism: u32,
    pub resource_profile: ResourceProfile,
    /// Opaque configuration shipped verbatim in the deployment descriptor.
    #[serde(default)]
    pub task_configuration: serde_json::Value,
}

impl JobVertex {
    pub fn new(name: impl Into<String>, parallelism: u32, resource_profile: ResourceProfile) -> Self {
        Self {
            id: JobVertexId::new(),
            name: name.into(),
            parallelism: parallelism.max(1),
            resource_profile,
            task_configuration: serde_json::Value::Null,
        }
    }

    pub fn with_configuration(mut self, task_configuration: serde_json::Value) -> Self {
        self.task_configuration = task_configuration;
        self
    }
}

/// The client-submitted description of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGraph {
    pub job_id: JobId,
    pub name: String,
    pub vertices: Vec<JobVertex>,
    pub edges: Vec<JobEdge>,
}

impl JobGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            job_id: JobId::new(),
            name: name.into(),
            vertices: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn add_vertex(&mut self, vertex: JobVertex) -> JobVertexId {
        let id = vertex.id;
        self.vertices.push(vertex);
        id
    }

    pub fn connect(&mut self, source: JobVertexId, target: JobVertexId, pattern: DistributionPattern) {
        self.edges.push(JobEdge {
            source,
            target,
            pattern,
        });
    }

    pub fn vertex(&self, id: JobVertexId) -> Option<&JobVertex> {
        self.vertices.iter().find(|v| v.id == id)
    }

    /// Vertices with no incoming edge; these receive checkpoint triggers.
    pub fn source_vertices(&self) -> Vec<&JobVertex> {
        let targets: HashSet<JobVertexId> = self.edges.iter().map(|e| e.target).collect();
        self.vertices
            .iter()
            .filter(|v| !targets.contains(&v.id))
            .collect()
    }

    pub fn inputs_of(&self, id: JobVertexId) -> Vec<&JobEdge> {
        self.edges.iter().filter(|e| e.target == id).collect()
    }

    pub fn outputs_of(&self, id: JobVertexId) -> Vec<&JobEdge> {
        self.edges.iter().filter(|e| e.source == id).collect()
    }

    /// Validation applied at submission time. Rejects empty graphs, edges
    /// referencing unknown vertices, cycles, and a mix of concrete and
    /// unknown resource profiles across vertices.
    pub fn validate(&self) -> Result<()> {
        if self.vertices.is_empty() {
            return Err(RuntimeError::InvalidJob("job graph has no vertices".into()));
        }

        let known: HashSet<JobVertexId> = self.vertices.iter().map(|v| v.id).collect();
        if known.len() != self.vertices.len() {
            return Err(RuntimeError::InvalidJob("duplicate vertex id".into()));
        }
        for edge in &self.edges {
            if !known.contains(&edge.source) || !known.contains(&edge.target) {
                return Err(RuntimeError::InvalidJob(
                    "edge references an unknown vertex".into(),
                ));
            }
        }

        let any_unknown = self.vertices.iter().any(|v| v.resource_profile.is_unknown());
        let any_specified = self.vertices.iter().any(|v| !v.resource_profile.is_unknown());
        if any_unknown && any_specified {
            return Err(RuntimeError::InvalidJob(
                "either all vertices declare resource profiles or none do".into(),
            ));
        }

        self.topological_order().map(|_| ())
    }

    /// Vertices in topological order; fails on cycles.
    pub fn topological_order(&self) -> Result<Vec<&JobVertex>> {
        let mut in_degree: HashMap<JobVertexId, usize> =
            self.vertices.iter().map(|v| (v.id, 0)).collect();
        for edge in &self.edges {
            if let Some(d) = in_degree.get_mut(&edge.target) {
                *d += 1;
            }
        }

        let mut queue: VecDeque<JobVertexId> = self
            .vertices
            .iter()
            .filter(|v| in_degree[&v.id] == 0)
            .map(|v| v.id)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(id) = queue.pop_front() {
            if let Some(vertex) = self.vertex(id) {
                order.push(vertex);
            }
            for edge in self.outputs_of(id) {
                let d = in_degree
                    .get_mut(&edge.target)
                    .expect("validated edge target");
                *d -= 1;
                if *d == 0 {
                    queue.push_back(edge.target);
                }
            }
        }

        if order.len() != self.vertices.len() {
            return Err(RuntimeError::InvalidJob("job graph contains a cycle".into()));
        }
        Ok(order)
    }
}
