//! The master process: cluster entry, dispatcher, resource manager and the
//! per-job job masters with their slot pools, scheduler and checkpoint
//! coordinator.

pub mod archived;
pub mod dispatcher;
pub mod entry;
pub mod jobmaster;
pub mod resource_manager;

pub use archived::ArchivedExecutionGraphStore;
pub use dispatcher::Dispatcher;
pub use entry::{ClusterComponents, ClusterEntry, RUNTIME_FAILURE_EXIT_CODE, STARTUP_FAILURE_EXIT_CODE};
pub use jobmaster::JobMaster;
pub use resource_manager::{NoOpWorkerProvisioner, ResourceManager, WorkerProvisioner};
