//! One-time bootstrap of the master process.
//!
//! Services start in a fixed order because each depends on the ones before
//! it; on any failure the already-created services are torn down in reverse
//! order under a bounded timeout and the process exits with the startup
//! failure code. Runtime failures in a child component exit with a distinct
//! code through the shutdown coordinator.

use crate::archived::ArchivedExecutionGraphStore;
use crate::dispatcher::Dispatcher;
use crate::resource_manager::{NoOpWorkerProvisioner, ResourceManager};
use parking_lot::RwLock;
use rivulet_core::config::RuntimeConfig;
use rivulet_core::gateway::RpcRegistry;
use rivulet_core::ha::{HighAvailabilityServices, LeaderContender, LeaderElectionService};
use rivulet_core::ids::ResourceManagerId;
use rivulet_core::metrics::MetricRegistry;
use rivulet_core::shutdown::ShutdownCoordinator;
use rivulet_core::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Exit code for failures during `ClusterEntry::start`.
pub const STARTUP_FAILURE_EXIT_CODE: i32 = 1;
/// Exit code for fatal failures after startup completed.
pub const RUNTIME_FAILURE_EXIT_CODE: i32 = 2;

const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// In-memory stand-in for the user-code blob storage. The real service is an
/// external collaborator; the master only needs put/get semantics.
#[derive(Default)]
pub struct BlobServer {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
}

impl BlobServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: Vec<u8>) {
        self.blobs.write().insert(key.into(), data);
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs.read().get(key).cloned()
    }

    pub fn close(&self) {
        self.blobs.write().clear();
    }
}

/// Everything `start` produced, in dependency order.
pub struct ClusterComponents {
    pub config: RuntimeConfig,
    pub ha: HighAvailabilityServices,
    pub rpc_registry: Arc<RpcRegistry>,
    pub blob_server: Arc<BlobServer>,
    pub metrics: Arc<MetricRegistry>,
    pub archived: Arc<ArchivedExecutionGraphStore>,
    pub resource_manager: Arc<ResourceManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: ShutdownCoordinator,
}

struct ResourceManagerContender {
    resource_manager: Arc<ResourceManager>,
}

impl LeaderContender for ResourceManagerContender {
    fn grant_leadership(&self, leader_session_id: Uuid) {
        self.resource_manager
            .grant_leadership(ResourceManagerId::from_uuid(leader_session_id));
    }

    fn revoke_leadership(&self) {
        warn!("resource manager leadership revoked");
    }
}

struct DispatcherContender {
    dispatcher: Arc<Dispatcher>,
}

impl LeaderContender for DispatcherContender {
    fn grant_leadership(&self, leader_session_id: Uuid) {
        debug!(session = %leader_session_id, "dispatcher leadership granted");
        let dispatcher = Arc::clone(&self.dispatcher);
        tokio::spawn(async move {
            if let Err(e) = dispatcher.recover_jobs().await {
                warn!("job recovery failed: {e}");
            }
        });
    }

    fn revoke_leadership(&self) {
        warn!("dispatcher leadership revoked");
    }
}

/// Bootstraps the master process.
pub struct ClusterEntry;

impl ClusterEntry {
    /// Initialize all shared services and the dispatcher/resource-manager
    /// composite. Ordering is load-bearing; see the module docs.
    pub async fn start(mut config: RuntimeConfig) -> Result<ClusterComponents> {
        let mut teardown: Vec<(&'static str, Box<dyn FnOnce() + Send>)> = Vec::new();

        let result = Self::start_inner(&mut config, &mut teardown).await;
        match result {
            Ok(components) => Ok(components),
            Err(e) => {
                warn!("startup failed, tearing down partial services: {e}");
                run_teardown(teardown).await;
                Err(e)
            }
        }
    }

    async fn start_inner(
        config: &mut RuntimeConfig,
        teardown: &mut Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
    ) -> Result<ClusterComponents> {
        config.validate()?;

        // Working directory for the master process.
        let working_directory =
            std::env::temp_dir().join(format!("rivulet-master-{}", Uuid::new_v4().simple()));
        std::fs::create_dir_all(&working_directory)?;
        info!(path = %working_directory.display(), "working directory created");
        {
            let dir = working_directory.clone();
            teardown.push((
                "working-directory",
                Box::new(move || {
                    let _ = std::fs::remove_dir_all(dir);
                }),
            ));
        }

        // Security context: external concern, installed before any service
        // binds an endpoint.
        install_security_context(config)?;

        // The in-process transport. A bound network transport would write
        // its port back here; the registry advertises a synthetic address.
        if config.address.ends_with(":0") {
            config.address = format!("master-{}", Uuid::new_v4().simple());
        }
        let rpc_registry = Arc::new(RpcRegistry::new());

        let ha = HighAvailabilityServices::embedded();

        let blob_server = Arc::new(BlobServer::new());
        {
            let blob_server = Arc::clone(&blob_server);
            teardown.push(("blob-server", Box::new(move || blob_server.close())));
        }

        let metrics = Arc::new(MetricRegistry::new());
        let archived = Arc::new(ArchivedExecutionGraphStore::default());
        let shutdown = ShutdownCoordinator::new();

        let resource_manager = ResourceManager::new(
            config.clone(),
            Arc::new(NoOpWorkerProvisioner),
            Arc::clone(&rpc_registry) as _,
            Arc::clone(&rpc_registry) as _,
        );
        ha.resource_manager_leader_election
            .start(Arc::new(ResourceManagerContender {
                resource_manager: Arc::clone(&resource_manager),
            }))
            .await?;
        if resource_manager.fencing_token().is_none() {
            return Err(RuntimeError::Fatal(
                "resource manager did not obtain leadership".into(),
            ));
        }

        let dispatcher = Dispatcher::new(
            config.clone(),
            ha.clone(),
            Arc::clone(&rpc_registry),
            Arc::clone(&resource_manager),
            Arc::clone(&archived),
            Arc::clone(&metrics),
            shutdown.clone(),
        );
        ha.dispatcher_leader_election
            .start(Arc::new(DispatcherContender {
                dispatcher: Arc::clone(&dispatcher),
            }))
            .await?;

        info!(address = %config.address, "cluster entry finished bootstrapping");
        Ok(ClusterComponents {
            config: config.clone(),
            ha,
            rpc_registry,
            blob_server,
            metrics,
            archived,
            resource_manager,
            dispatcher,
            shutdown,
        })
    }
}

fn install_security_context(_config: &RuntimeConfig) -> Result<()> {
    // TLS and authentication are deployment concerns layered onto the
    // transport; nothing to install for the in-process registry.
    debug!("security context installed");
    Ok(())
}

async fn run_teardown(teardown: Vec<(&'static str, Box<dyn FnOnce() + Send>)>) {
    for (name, action) in teardown.into_iter().rev() {
        debug!(service = name, "tearing down");
        let done = tokio::task::spawn_blocking(action);
        if tokio::time::timeout(TEARDOWN_TIMEOUT, done).await.is_err() {
            warn!(service = name, "teardown timed out");
        }
    }
}
