//! High-availability service seam.
//!
//! The core depends on four capabilities: leader election per role, a
//! running-jobs registry, durable job-graph storage, and a checkpoint id
//! counter plus metadata sink per job. What backs them is not the runtime's
//! business; the embedded implementations here keep everything in process
//! memory and grant leadership immediately, which is the standalone-cluster
//! mode and what the tests run against.

use crate::error::Result;
use crate::ids::JobId;
use crate::jobgraph::JobGraph;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rivulet_checkpoint::{CheckpointStorage, InMemoryCheckpointStorage};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A component competing for leadership of one role.
pub trait LeaderContender: Send + Sync {
    /// Leadership granted under `leader_session_id`; the contender derives
    /// its fencing token from it.
    fn grant_leadership(&self, leader_session_id: Uuid);

    /// Leadership lost; the contender must stop issuing fenced calls.
    fn revoke_leadership(&self);
}

/// Election service for one role.
#[async_trait]
pub trait LeaderElectionService: Send + Sync {
    async fn start(&self, contender: Arc<dyn LeaderContender>) -> Result<()>;
    async fn stop(&self) -> Result<()>;
}

/// Terminal registry status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryJobStatus {
    Running,
    Done,
}

/// Cluster-wide record of which jobs run or have finished, consulted on
/// recovery so completed jobs are not re-run.
#[async_trait]
pub trait RunningJobsRegistry: Send + Sync {
    async fn set_job_running(&self, job_id: JobId) -> Result<()>;
    async fn set_job_finished(&self, job_id: JobId) -> Result<()>;
    async fn get_job_status(&self, job_id: JobId) -> Result<Option<RegistryJobStatus>>;
    /// Forget the job entirely, e.g. after its graph was removed.
    async fn clear_job(&self, job_id: JobId) -> Result<()>;
}

/// Durable storage for submitted job graphs, enumerated on master recovery.
#[async_trait]
pub trait JobGraphStore: Send + Sync {
    async fn put_job_graph(&self, job_graph: &JobGraph) -> Result<()>;
    async fn remove_job_graph(&self, job_id: JobId) -> Result<()>;
    async fn job_ids(&self) -> Result<Vec<JobId>>;
    async fn recover_job_graph(&self, job_id: JobId) -> Result<Option<JobGraph>>;
}

/// Monotonic checkpoint id source, one sequence per job.
#[async_trait]
pub trait CheckpointIdCounter: Send + Sync {
    async fn get_and_increment(&self, job_id: JobId) -> Result<u64>;
    async fn reset(&self, job_id: JobId, value: u64) -> Result<()>;
}

/// Bundle of every HA capability, handed to components at construction.
#[derive(Clone)]
pub struct HighAvailabilityServices {
    pub dispatcher_leader_election: Arc<dyn LeaderElectionService>,
    pub resource_manager_leader_election: Arc<dyn LeaderElectionService>,
    pub running_jobs_registry: Arc<dyn RunningJobsRegistry>,
    pub job_graph_store: Arc<dyn JobGraphStore>,
    pub checkpoint_id_counter: Arc<dyn CheckpointIdCounter>,
    checkpoint_storages: Arc<RwLock<HashMap<JobId, Arc<dyn CheckpointStorage>>>>,
}

impl HighAvailabilityServices {
    /// Fully in-memory services for a standalone cluster.
    pub fn embedded() -> Self {
        Self {
            dispatcher_leader_election: Arc::new(EmbeddedLeaderService::new()),
            resource_manager_leader_election: Arc::new(EmbeddedLeaderService::new()),
            running_jobs_registry: Arc::new(EmbeddedRunningJobsRegistry::default()),
            job_graph_store: Arc::new(EmbeddedJobGraphStore::default()),
            checkpoint_id_counter: Arc::new(EmbeddedCheckpointIdCounter::default()),
            checkpoint_storages: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Election service for the master of `job_id`. The embedded services
    /// grant every job master immediately.
    pub fn job_master_leader_election(&self, _job_id: JobId) -> Arc<dyn LeaderElectionService> {
        Arc::new(EmbeddedLeaderService::new())
    }

    /// Checkpoint metadata storage scoped to one job; created on first use.
    pub fn checkpoint_storage(&self, job_id: JobId) -> Arc<dyn CheckpointStorage> {
        if let Some(storage) = self.checkpoint_storages.read().get(&job_id) {
            return Arc::clone(storage);
        }
        let mut storages = self.checkpoint_storages.write();
        Arc::clone(
            storages
                .entry(job_id)
                .or_insert_with(|| Arc::new(InMemoryCheckpointStorage::new())),
        )
    }
}

/// Election service that grants leadership to the first contender
/// immediately and keeps it until stopped.
pub struct EmbeddedLeaderService {
    contender: Mutex<Option<Arc<dyn LeaderContender>>>,
    session: Mutex<Option<Uuid>>,
}

impl EmbeddedLeaderService {
    pub fn new() -> Self {
        Self {
            contender: Mutex::new(None),
            session: Mutex::new(None),
        }
    }

    /// Force a leadership change, revoking the current session and granting
    /// a fresh one. Used by suspension tests.
    pub fn regrant(&self) {
        let contender = self.contender.lock().clone();
        if let Some(contender) = contender {
            contender.revoke_leadership();
            let session = Uuid::new_v4();
            *self.session.lock() = Some(session);
            contender.grant_leadership(session);
        }
    }

    /// Revoke leadership without granting a new session.
    pub fn revoke(&self) {
        *self.session.lock() = None;
        if let Some(contender) = self.contender.lock().clone() {
            contender.revoke_leadership();
        }
    }

    pub fn current_session(&self) -> Option<Uuid> {
        *self.session.lock()
    }
}

impl Default for EmbeddedLeaderService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaderElectionService for EmbeddedLeaderService {
    async fn start(&self, contender: Arc<dyn LeaderContender>) -> Result<()> {
        let session = Uuid::new_v4();
        *self.contender.lock() = Some(Arc::clone(&contender));
        *self.session.lock() = Some(session);
        debug!(session = %session, "embedded leader election granted leadership");
        contender.grant_leadership(session);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.revoke();
        *self.contender.lock() = None;
        Ok(())
    }
}

#[derive(Default)]
pub struct EmbeddedRunningJobsRegistry {
    entries: RwLock<HashMap<JobId, RegistryJobStatus>>,
}

#[async_trait]
impl RunningJobsRegistry for EmbeddedRunningJobsRegistry {
    async fn set_job_running(&self, job_id: JobId) -> Result<()> {
        self.entries.write().insert(job_id, RegistryJobStatus::Running);
        Ok(())
    }

    async fn set_job_finished(&self, job_id: JobId) -> Result<()> {
        self.entries.write().insert(job_id, RegistryJobStatus::Done);
        Ok(())
    }

    async fn get_job_status(&self, job_id: JobId) -> Result<Option<RegistryJobStatus>> {
        Ok(self.entries.read().get(&job_id).copied())
    }

    async fn clear_job(&self, job_id: JobId) -> Result<()> {
        self.entries.write().remove(&job_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct EmbeddedJobGraphStore {
    graphs: RwLock<HashMap<JobId, JobGraph>>,
}

#[async_trait]
impl JobGraphStore for EmbeddedJobGraphStore {
    async fn put_job_graph(&self, job_graph: &JobGraph) -> Result<()> {
        self.graphs
            .write()
            .insert(job_graph.job_id, job_graph.clone());
        Ok(())
    }

    async fn remove_job_graph(&self, job_id: JobId) -> Result<()> {
        self.graphs.write().remove(&job_id);
        Ok(())
    }

    async fn job_ids(&self) -> Result<Vec<JobId>> {
        Ok(self.graphs.read().keys().copied().collect())
    }

    async fn recover_job_graph(&self, job_id: JobId) -> Result<Option<JobGraph>> {
        Ok(self.graphs.read().get(&job_id).cloned())
    }
}

#[derive(Default)]
pub struct EmbeddedCheckpointIdCounter {
    counters: Mutex<HashMap<JobId, u64>>,
}

#[async_trait]
impl CheckpointIdCounter for EmbeddedCheckpointIdCounter {
    async fn get_and_increment(&self, job_id: JobId) -> Result<u64> {
        let mut counters = self.counters.lock();
        let counter = counters.entry(job_id).or_insert(1);
        let id = *counter;
        *counter += 1;
        Ok(id)
    }

    async fn reset(&self, job_id: JobId, value: u64) -> Result<()> {
        self.counters.lock().insert(job_id, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobgraph::{JobGraph, JobVertex};
    use crate::resources::ResourceProfile;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingContender {
        grants: AtomicUsize,
        revokes: AtomicUsize,
    }

    impl LeaderContender for RecordingContender {
        fn grant_leadership(&self, _leader_session_id: Uuid) {
            self.grants.fetch_add(1, Ordering::SeqCst);
        }

        fn revoke_leadership(&self) {
            self.revokes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_embedded_election_grants_immediately() {
        let service = EmbeddedLeaderService::new();
        let contender = Arc::new(RecordingContender {
            grants: AtomicUsize::new(0),
            revokes: AtomicUsize::new(0),
        });
        service.start(contender.clone()).await.unwrap();
        assert_eq!(contender.grants.load(Ordering::SeqCst), 1);

        service.regrant();
        assert_eq!(contender.revokes.load(Ordering::SeqCst), 1);
        assert_eq!(contender.grants.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_registry_remembers_done_jobs() {
        let registry = EmbeddedRunningJobsRegistry::default();
        let job_id = JobId::new();

        registry.set_job_running(job_id).await.unwrap();
        assert_eq!(
            registry.get_job_status(job_id).await.unwrap(),
            Some(RegistryJobStatus::Running)
        );

        registry.set_job_finished(job_id).await.unwrap();
        assert_eq!(
            registry.get_job_status(job_id).await.unwrap(),
            Some(RegistryJobStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_job_graph_store_roundtrip() {
        let store = EmbeddedJobGraphStore::default();
        let mut graph = JobGraph::new("persisted");
        graph.add_vertex(JobVertex::new("v", 1, ResourceProfile::new(1.0, 64)));

        store.put_job_graph(&graph).await.unwrap();
        assert_eq!(store.job_ids().await.unwrap(), vec![graph.job_id]);

        let recovered = store.recover_job_graph(graph.job_id).await.unwrap().unwrap();
        assert_eq!(recovered.name, "persisted");

        store.remove_job_graph(graph.job_id).await.unwrap();
        assert!(store.job_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_id_counter_is_monotonic_per_job() {
        let counter = EmbeddedCheckpointIdCounter::default();
        let job_a = JobId::new();
        let job_b = JobId::new();

        assert_eq!(counter.get_and_increment(job_a).await.unwrap(), 1);
        assert_eq!(counter.get_and_increment(job_a).await.unwrap(), 2);
        assert_eq!(counter.get_and_increment(job_b).await.unwrap(), 1);

        counter.reset(job_a, 10).await.unwrap();
        assert_eq!(counter.get_and_increment(job_a).await.unwrap(), 10);
    }
}
