//! The dispatcher: accepts job submissions, persists them, and runs one job
//! master per accepted job.

use crate::archived::ArchivedExecutionGraphStore;
use crate::jobmaster::scheduler::{FailoverStrategy, RestartAllStrategy};
use crate::jobmaster::JobMaster;
use crate::resource_manager::ResourceManager;
use async_trait::async_trait;
use parking_lot::Mutex;
use rivulet_core::config::RuntimeConfig;
use rivulet_core::gateway::{
    Ack, ArchivedExecutionGraph, DispatcherGateway, JobMasterGateway, ResourceManagerGateway,
    RpcRegistry,
};
use rivulet_core::ha::{
    HighAvailabilityServices, LeaderContender, LeaderElectionService, RegistryJobStatus,
};
use rivulet_core::ids::{JobId, JobMasterId, ResourceManagerId};
use rivulet_core::jobgraph::JobGraph;
use rivulet_core::metrics::MetricRegistry;
use rivulet_core::shutdown::ShutdownCoordinator;
use rivulet_core::state::{ApplicationStatus, JobStatus};
use rivulet_core::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

struct JobEntry {
    master: Arc<JobMaster>,
    /// Kept alive so the per-job election can revoke and regrant.
    _election: Arc<dyn LeaderElectionService>,
}

/// Grants and revokes one job master's leadership; the fencing token is
/// derived from the leader session id.
struct JobMasterContender {
    job_master: Arc<JobMaster>,
    rpc_registry: Arc<RpcRegistry>,
    resource_manager_id: ResourceManagerId,
    resource_manager: Arc<dyn ResourceManagerGateway>,
}

impl LeaderContender for JobMasterContender {
    fn grant_leadership(&self, leader_session_id: uuid::Uuid) {
        let token = JobMasterId::from_uuid(leader_session_id);
        self.rpc_registry.register_job_master(
            self.job_master.address().to_string(),
            token,
            Arc::clone(&self.job_master) as Arc<dyn JobMasterGateway>,
        );
        let job_master = Arc::clone(&self.job_master);
        let resource_manager_id = self.resource_manager_id;
        let resource_manager = Arc::clone(&self.resource_manager);
        tokio::spawn(async move {
            if let Err(e) = job_master
                .start(token, resource_manager_id, resource_manager)
                .await
            {
                warn!(job = %job_master.job_id(), "job master start failed: {e}");
            }
        });
    }

    fn revoke_leadership(&self) {
        self.rpc_registry
            .unregister_job_master(self.job_master.address());
        self.job_master.suspend("leadership revoked");
    }
}

/// Master-side front door for jobs.
pub struct Dispatcher {
    config: RuntimeConfig,
    ha: HighAvailabilityServices,
    rpc_registry: Arc<RpcRegistry>,
    resource_manager: Arc<ResourceManager>,
    archived: Arc<ArchivedExecutionGraphStore>,
    metrics: Arc<MetricRegistry>,
    shutdown: ShutdownCoordinator,
    failover: Arc<dyn FailoverStrategy>,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    /// Back-reference for gateway handlers that spawn job masters.
    self_ref: std::sync::Weak<Dispatcher>,
}

impl Dispatcher {
    pub fn new(
        config: RuntimeConfig,
        ha: HighAvailabilityServices,
        rpc_registry: Arc<RpcRegistry>,
        resource_manager: Arc<ResourceManager>,
        archived: Arc<ArchivedExecutionGraphStore>,
        metrics: Arc<MetricRegistry>,
        shutdown: ShutdownCoordinator,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            config,
            ha,
            rpc_registry,
            resource_manager,
            archived,
            metrics,
            shutdown,
            failover: Arc::new(RestartAllStrategy),
            jobs: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    pub fn num_running_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn job_master(&self, job_id: JobId) -> Option<Arc<JobMaster>> {
        self.jobs.lock().get(&job_id).map(|e| Arc::clone(&e.master))
    }

    /// Recover every persisted job graph that has not completed. Called on
    /// leadership grant after a master restart.
    pub async fn recover_jobs(self: &Arc<Self>) -> Result<()> {
        let job_ids = self.ha.job_graph_store.job_ids().await?;
        for job_id in job_ids {
            if self.jobs.lock().contains_key(&job_id) {
                continue;
            }
            match self.ha.running_jobs_registry.get_job_status(job_id).await? {
                Some(RegistryJobStatus::Done) => {
                    // Completed in a previous incarnation; never re-run.
                    continue;
                }
                _ => {}
            }
            let Some(graph) = self.ha.job_graph_store.recover_job_graph(job_id).await? else {
                continue;
            };
            info!(job = %job_id, "recovering persisted job");
            self.start_job_master(graph).await?;
        }
        Ok(())
    }

    async fn start_job_master(self: &Arc<Self>, graph: JobGraph) -> Result<()> {
        let job_id = graph.job_id;
        let job_master = JobMaster::new(
            graph,
            format!("jm-{job_id}"),
            self.config.clone(),
            &self.ha,
            Arc::clone(&self.rpc_registry) as _,
            Arc::clone(&self.failover),
        )?;

        let resource_manager_id = self
            .resource_manager
            .fencing_token()
            .ok_or_else(|| RuntimeError::other("resource manager has no leadership"))?;

        // The per-job election grants leadership (immediately, in embedded
        // mode); the contender registers the master's address and starts it
        // under the session-derived fencing token.
        let election = self.ha.job_master_leader_election(job_id);
        election
            .start(Arc::new(JobMasterContender {
                job_master: Arc::clone(&job_master),
                rpc_registry: Arc::clone(&self.rpc_registry),
                resource_manager_id,
                resource_manager: Arc::clone(&self.resource_manager)
                    as Arc<dyn ResourceManagerGateway>,
            }))
            .await?;

        self.jobs.lock().insert(
            job_id,
            JobEntry {
                master: Arc::clone(&job_master),
                _election: election,
            },
        );
        self.metrics.increment("jobs_started");

        // Watch for termination: archive, mark DONE, clean up.
        let dispatcher = Arc::clone(self);
        let mut termination = job_master.termination_watch();
        let watched = Arc::clone(&job_master);
        tokio::spawn(async move {
            loop {
                let status = *termination.borrow();
                if let Some(status) = status {
                    dispatcher.on_job_terminated(&watched, status).await;
                    return;
                }
                if termination.changed().await.is_err() {
                    return;
                }
            }
        });
        Ok(())
    }

    async fn on_job_terminated(&self, job_master: &Arc<JobMaster>, status: JobStatus) {
        let job_id = job_master.job_id();
        info!(job = %job_id, %status, "job terminated");
        self.archived.put(ArchivedExecutionGraph {
            job_id,
            name: job_master.job_name().to_string(),
            status,
            failure_cause: None,
            finished_at: chrono::Utc::now().timestamp_millis(),
        });
        if let Err(e) = self.ha.running_jobs_registry.set_job_finished(job_id).await {
            warn!(job = %job_id, "marking job finished failed: {e}");
        }
        if let Err(e) = self.ha.job_graph_store.remove_job_graph(job_id).await {
            warn!(job = %job_id, "removing job graph failed: {e}");
        }
        self.rpc_registry.unregister_job_master(job_master.address());
        self.jobs.lock().remove(&job_id);
        self.metrics.increment("jobs_terminated");
    }
}

#[async_trait]
impl DispatcherGateway for Dispatcher {
    async fn submit_job(&self, job_graph: JobGraph) -> Result<Ack> {
        let job_id = job_graph.job_id;

        if self.jobs.lock().contains_key(&job_id) {
            return Err(RuntimeError::DuplicateJob(job_id));
        }
        if self
            .ha
            .running_jobs_registry
            .get_job_status(job_id)
            .await?
            .is_some()
        {
            return Err(RuntimeError::DuplicateJob(job_id));
        }

        job_graph.validate()?;

        // Persist before starting: recovery depends on it.
        self.ha.job_graph_store.put_job_graph(&job_graph).await?;
        self.ha.running_jobs_registry.set_job_running(job_id).await?;

        info!(job = %job_id, name = %job_graph.name, "job submitted");
        self.metrics.increment("jobs_submitted");

        let this = self
            .self_ref
            .upgrade()
            .ok_or_else(|| RuntimeError::ShutDown("dispatcher".into()))?;
        this.start_job_master(job_graph).await?;
        Ok(Ack)
    }

    async fn cancel_job(&self, job_id: JobId) -> Result<Ack> {
        let job_master = self
            .job_master(job_id)
            .ok_or(RuntimeError::JobNotFound(job_id))?;
        job_master.cancel().await?;
        Ok(Ack)
    }

    async fn list_jobs(&self) -> Result<Vec<JobId>> {
        Ok(self.jobs.lock().keys().copied().collect())
    }

    async fn request_job_status(&self, job_id: JobId) -> Result<JobStatus> {
        if let Some(job_master) = self.job_master(job_id) {
            return Ok(job_master.status());
        }
        self.archived
            .get(job_id)
            .map(|a| a.status)
            .ok_or(RuntimeError::JobNotFound(job_id))
    }

    async fn request_job_result(&self, job_id: JobId) -> Result<ArchivedExecutionGraph> {
        self.archived
            .get(job_id)
            .ok_or(RuntimeError::JobNotFound(job_id))
    }

    async fn trigger_savepoint(
        &self,
        job_id: JobId,
        target_directory: String,
        cancel_job: bool,
    ) -> Result<String> {
        let job_master = self
            .job_master(job_id)
            .ok_or(RuntimeError::JobNotFound(job_id))?;
        job_master.trigger_savepoint(&target_directory, cancel_job).await
    }

    async fn shut_down_cluster(&self, status: ApplicationStatus) -> Result<Ack> {
        info!(?status, "cluster shutdown requested");
        self.shutdown.request_shutdown(status);
        Ok(Ack)
    }
}
