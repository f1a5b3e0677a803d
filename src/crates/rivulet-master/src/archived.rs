//! Bounded store of finished jobs, queried after their masters are gone.

use parking_lot::RwLock;
use rivulet_core::gateway::ArchivedExecutionGraph;
use rivulet_core::ids::JobId;
use std::collections::{HashMap, VecDeque};

/// Keeps the most recent terminal jobs for status and result queries.
pub struct ArchivedExecutionGraphStore {
    capacity: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<JobId, ArchivedExecutionGraph>,
    order: VecDeque<JobId>,
}

impl ArchivedExecutionGraphStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn put(&self, graph: ArchivedExecutionGraph) {
        let mut inner = self.inner.write();
        if inner.entries.insert(graph.job_id, graph.clone()).is_none() {
            inner.order.push_back(graph.job_id);
        }
        while inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
            }
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<ArchivedExecutionGraph> {
        self.inner.read().entries.get(&job_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl Default for ArchivedExecutionGraphStore {
    fn default() -> Self {
        Self::new(64)
    }
}
