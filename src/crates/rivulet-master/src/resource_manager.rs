//! The resource manager: brokers slots between workers and job masters.

use async_trait::async_trait;
use parking_lot::Mutex;
use rivulet_core::config::RuntimeConfig;
use rivulet_core::executor::MainThreadExecutor;
use rivulet_core::gateway::{
    check_fencing_token, Ack, JobMasterResolver, RegistrationResponse, ResourceManagerGateway,
    SlotReport, SlotRequestBody, TaskExecutorGateway, TaskExecutorResolver,
    TaskExecutorRegistration,
};
use rivulet_core::heartbeat::{HeartbeatListener, HeartbeatSender, HeartbeatTarget};
use rivulet_core::ids::{
    AllocationId, JobId, JobMasterId, RegistrationId, ResourceId, ResourceManagerId, SlotId,
};
use rivulet_core::resources::ResourceProfile;
use rivulet_core::{Result, RuntimeError};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Requests new workers when slot supply is insufficient. Cluster managers
/// plug in here; the standalone cluster uses the no-op.
pub trait WorkerProvisioner: Send + Sync {
    fn request_new_worker(&self, resource_profile: &ResourceProfile);
}

/// Standalone mode: workers register themselves, nobody is provisioned.
pub struct NoOpWorkerProvisioner;

impl WorkerProvisioner for NoOpWorkerProvisioner {
    fn request_new_worker(&self, resource_profile: &ResourceProfile) {
        debug!(%resource_profile, "no provisioner configured, parking request");
    }
}

struct TrackedSlot {
    status: rivulet_core::gateway::SlotStatus,
    /// Set while an allocation is in flight toward the worker but not yet
    /// visible in its report.
    reserved_for: Option<AllocationId>,
}

struct TaskExecutorEntry {
    registration_id: RegistrationId,
    gateway: Arc<dyn TaskExecutorGateway>,
    address: String,
    slots: HashMap<SlotId, TrackedSlot>,
}

#[derive(Clone)]
struct PendingRmRequest {
    allocation_id: AllocationId,
    job_id: JobId,
    resource_profile: ResourceProfile,
    job_master_address: String,
}

struct RmState {
    /// Registration order preserved; the matching tie-break depends on it.
    task_executors: Vec<(ResourceId, TaskExecutorEntry)>,
    pending_requests: Vec<PendingRmRequest>,
    /// Allocation → the job master that asked, for failure notification.
    allocation_owner: HashMap<AllocationId, String>,
}

struct TeHeartbeatListener {
    resource_manager: Weak<ResourceManager>,
}

impl HeartbeatListener<SlotReport, ()> for TeHeartbeatListener {
    fn report_payload(&self, resource_id: ResourceId, payload: SlotReport) {
        if let Some(rm) = self.resource_manager.upgrade() {
            rm.reconcile_slot_report(resource_id, payload);
        }
    }

    fn retrieve_payload(&self, _resource_id: ResourceId) {}

    fn notify_heartbeat_timeout(&self, resource_id: ResourceId) {
        if let Some(rm) = self.resource_manager.upgrade() {
            tokio::spawn(async move {
                let _ = rm
                    .disconnect_task_executor(resource_id, "heartbeat timeout".to_string())
                    .await;
            });
        }
    }
}

struct TeHeartbeatTarget {
    gateway: Arc<dyn TaskExecutorGateway>,
}

#[async_trait]
impl HeartbeatTarget<()> for TeHeartbeatTarget {
    async fn receive_heartbeat(&self, _origin: ResourceId, _payload: ()) {}

    async fn request_heartbeat(&self, origin: ResourceId, _payload: ()) {
        let _ = self.gateway.heartbeat_from_resource_manager(origin).await;
    }
}

/// The cluster's slot broker.
pub struct ResourceManager {
    resource_manager_id: Mutex<Option<ResourceManagerId>>,
    state: Mutex<RmState>,
    provisioner: Arc<dyn WorkerProvisioner>,
    te_resolver: Arc<dyn TaskExecutorResolver>,
    jm_resolver: Arc<dyn JobMasterResolver>,
    heartbeats: HeartbeatSender<SlotReport, ()>,
    self_ref: Weak<ResourceManager>,
}

impl ResourceManager {
    pub fn new(
        config: RuntimeConfig,
        provisioner: Arc<dyn WorkerProvisioner>,
        te_resolver: Arc<dyn TaskExecutorResolver>,
        jm_resolver: Arc<dyn JobMasterResolver>,
    ) -> Arc<Self> {
        let own_resource_id = ResourceId::new();
        let executor = MainThreadExecutor::new("resource-manager");
        let heartbeat_interval = config.heartbeat_interval();
        let heartbeat_timeout = config.heartbeat_timeout();

        Arc::new_cyclic(|weak: &Weak<ResourceManager>| {
            let heartbeats = HeartbeatSender::new(
                own_resource_id,
                heartbeat_interval,
                heartbeat_timeout,
                Arc::new(TeHeartbeatListener {
                    resource_manager: weak.clone(),
                }),
                executor,
            );
            ResourceManager {
                resource_manager_id: Mutex::new(None),
                state: Mutex::new(RmState {
                    task_executors: Vec::new(),
                    pending_requests: Vec::new(),
                    allocation_owner: HashMap::new(),
                }),
                provisioner,
                te_resolver,
                jm_resolver,
                heartbeats,
                self_ref: weak.clone(),
            }
        })
    }

    /// Leadership granted: accept fenced traffic under this token.
    pub fn grant_leadership(&self, resource_manager_id: ResourceManagerId) {
        info!(token = %resource_manager_id, "resource manager leadership granted");
        *self.resource_manager_id.lock() = Some(resource_manager_id);
    }

    pub fn fencing_token(&self) -> Option<ResourceManagerId> {
        *self.resource_manager_id.lock()
    }

    pub fn num_registered_task_executors(&self) -> usize {
        self.state.lock().task_executors.len()
    }

    pub fn num_pending_requests(&self) -> usize {
        self.state.lock().pending_requests.len()
    }

    fn check_token(&self, received: &ResourceManagerId) -> Result<()> {
        check_fencing_token(self.resource_manager_id.lock().as_ref(), received)
    }

    /// Replace the tracked slots of one worker with its report. Slots the
    /// report no longer lists are implicitly freed.
    fn reconcile_slot_report(&self, resource_id: ResourceId, report: SlotReport) {
        {
            let mut state = self.state.lock();
            let Some((_, entry)) = state
                .task_executors
                .iter_mut()
                .find(|(id, _)| *id == resource_id)
            else {
                return;
            };
            entry.slots = report
                .slots
                .into_iter()
                .map(|status| {
                    (
                        status.slot_id,
                        TrackedSlot {
                            status,
                            reserved_for: None,
                        },
                    )
                })
                .collect();
        }
        // Supply may have changed; retry parked requests.
        self.serve_pending_requests();
    }

    /// Try to place parked requests against current supply.
    fn serve_pending_requests(&self) {
        let requests: Vec<PendingRmRequest> = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.pending_requests)
        };
        for request in requests {
            self.place_request(request);
        }
    }

    /// Find a slot per the matching policy and direct the worker to offer
    /// it; park the request when supply is insufficient.
    fn place_request(&self, request: PendingRmRequest) {
        let placement = {
            let mut state = self.state.lock();
            match find_matching_slot(&mut state, &request) {
                Some((slot_id, gateway)) => {
                    state
                        .allocation_owner
                        .insert(request.allocation_id, request.job_master_address.clone());
                    Some((slot_id, gateway))
                }
                None => {
                    debug!(
                        allocation = %request.allocation_id,
                        "no matching slot, provisioning and parking"
                    );
                    self.provisioner.request_new_worker(&request.resource_profile);
                    state.pending_requests.push(request.clone());
                    None
                }
            }
        };

        let Some((slot_id, gateway)) = placement else {
            return;
        };
        let Some(token) = self.fencing_token() else {
            return;
        };
        let allocation_id = request.allocation_id;
        let job_id = request.job_id;
        let profile = request.resource_profile.clone();
        let jm_address = request.job_master_address.clone();
        let rm = self.self_ref.clone();
        tokio::spawn(async move {
            if let Err(e) = gateway
                .request_slot(token, slot_id, job_id, allocation_id, profile, jm_address)
                .await
            {
                warn!(allocation = %allocation_id, "slot request to worker failed: {e}");
                // Clear the reservation and park the request again; the next
                // report or registration retries it.
                if let Some(rm) = rm.upgrade() {
                    let mut state = rm.state.lock();
                    for (_, entry) in state.task_executors.iter_mut() {
                        for slot in entry.slots.values_mut() {
                            if slot.reserved_for == Some(request.allocation_id) {
                                slot.reserved_for = None;
                            }
                        }
                    }
                    state.allocation_owner.remove(&request.allocation_id);
                    state.pending_requests.push(request);
                }
            }
        });
    }

    fn remove_task_executor(&self, resource_id: ResourceId) -> Option<TaskExecutorEntry> {
        let mut state = self.state.lock();
        let pos = state
            .task_executors
            .iter()
            .position(|(id, _)| *id == resource_id)?;
        let (_, entry) = state.task_executors.remove(pos);
        Some(entry)
    }
}

/// Matching policy: (i) a slot already allocated to the job and idle, then
/// (ii) an exact profile match, then (iii) any sufficient slot. Ties break
/// by worker registration order, which the Vec preserves.
fn find_matching_slot(
    state: &mut RmState,
    request: &PendingRmRequest,
) -> Option<(SlotId, Arc<dyn TaskExecutorGateway>)> {
    let mut same_job: Option<(SlotId, Arc<dyn TaskExecutorGateway>)> = None;
    let mut exact: Option<(SlotId, Arc<dyn TaskExecutorGateway>)> = None;
    let mut any: Option<(SlotId, Arc<dyn TaskExecutorGateway>)> = None;

    for (_, entry) in state.task_executors.iter() {
        for slot in entry.slots.values() {
            if slot.reserved_for.is_some() || !slot.status.is_free() {
                continue;
            }
            if !slot.status.resource_profile.matches(&request.resource_profile) {
                continue;
            }
            if same_job.is_none() && slot.status.job_id == Some(request.job_id) {
                same_job = Some((slot.status.slot_id, Arc::clone(&entry.gateway)));
            }
            if exact.is_none() && slot.status.resource_profile == request.resource_profile {
                exact = Some((slot.status.slot_id, Arc::clone(&entry.gateway)));
            }
            if any.is_none() {
                any = Some((slot.status.slot_id, Arc::clone(&entry.gateway)));
            }
        }
    }

    let chosen = same_job.or(exact).or(any)?;
    for (_, entry) in state.task_executors.iter_mut() {
        if let Some(slot) = entry.slots.get_mut(&chosen.0) {
            slot.reserved_for = Some(request.allocation_id);
        }
    }
    Some(chosen)
}

#[async_trait]
impl ResourceManagerGateway for ResourceManager {
    async fn register_task_executor(
        &self,
        resource_manager_id: ResourceManagerId,
        registration: TaskExecutorRegistration,
    ) -> Result<RegistrationResponse> {
        self.check_token(&resource_manager_id)?;

        let Some(gateway) = self
            .te_resolver
            .resolve_task_executor(&registration.address)
        else {
            return Ok(RegistrationResponse::Rejection {
                reason: format!("cannot resolve task executor at {}", registration.address),
            });
        };

        let registration_id = RegistrationId::new();
        {
            let mut state = self.state.lock();
            if let Some((_, entry)) = state
                .task_executors
                .iter_mut()
                .find(|(id, _)| *id == registration.resource_id)
            {
                // Idempotent re-registration: fresh token, keep position.
                entry.registration_id = registration_id;
                entry.gateway = Arc::clone(&gateway);
                entry.address = registration.address.clone();
            } else {
                state.task_executors.push((
                    registration.resource_id,
                    TaskExecutorEntry {
                        registration_id,
                        gateway: Arc::clone(&gateway),
                        address: registration.address.clone(),
                        slots: HashMap::new(),
                    },
                ));
            }
        }

        self.heartbeats.monitor_target(
            registration.resource_id,
            Arc::new(TeHeartbeatTarget { gateway }),
        );
        info!(
            worker = %registration.resource_id,
            slots = registration.num_slots,
            "task executor registered"
        );
        Ok(RegistrationResponse::Success { registration_id })
    }

    async fn send_slot_report(
        &self,
        resource_manager_id: ResourceManagerId,
        resource_id: ResourceId,
        registration_id: RegistrationId,
        slot_report: SlotReport,
    ) -> Result<Ack> {
        self.check_token(&resource_manager_id)?;
        {
            let state = self.state.lock();
            let known = state
                .task_executors
                .iter()
                .find(|(id, _)| *id == resource_id)
                .map(|(_, e)| e.registration_id);
            match known {
                Some(current) if current == registration_id => {}
                Some(_) => {
                    return Err(RuntimeError::Rpc(
                        "slot report from a stale registration".into(),
                    ))
                }
                None => return Err(RuntimeError::UnknownTaskExecutor(resource_id)),
            }
        }
        self.reconcile_slot_report(resource_id, slot_report);
        Ok(Ack)
    }

    async fn request_slot(
        &self,
        resource_manager_id: ResourceManagerId,
        _job_master_id: JobMasterId,
        request: SlotRequestBody,
    ) -> Result<Ack> {
        self.check_token(&resource_manager_id)?;
        debug!(
            job = %request.job_id,
            allocation = %request.allocation_id,
            "slot requested"
        );
        self.place_request(PendingRmRequest {
            allocation_id: request.allocation_id,
            job_id: request.job_id,
            resource_profile: request.resource_profile,
            job_master_address: request.job_master_address,
        });
        Ok(Ack)
    }

    async fn cancel_slot_request(
        &self,
        resource_manager_id: ResourceManagerId,
        allocation_id: AllocationId,
    ) -> Result<Ack> {
        self.check_token(&resource_manager_id)?;
        let mut state = self.state.lock();
        state
            .pending_requests
            .retain(|r| r.allocation_id != allocation_id);
        state.allocation_owner.remove(&allocation_id);
        // If the request is already in flight toward a worker, revocation is
        // best effort: clear the reservation so the slot can be re-matched
        // after the next report.
        for (_, entry) in state.task_executors.iter_mut() {
            for slot in entry.slots.values_mut() {
                if slot.reserved_for == Some(allocation_id) {
                    slot.reserved_for = None;
                }
            }
        }
        Ok(Ack)
    }

    async fn disconnect_task_executor(&self, resource_id: ResourceId, cause: String) -> Result<Ack> {
        warn!(worker = %resource_id, cause, "disconnecting task executor");
        self.heartbeats.unmonitor_target(resource_id);
        let Some(entry) = self.remove_task_executor(resource_id) else {
            return Ok(Ack);
        };

        // Surface allocation failures to the affected job masters.
        let affected: Vec<(AllocationId, String)> = {
            let mut state = self.state.lock();
            entry
                .slots
                .values()
                .filter_map(|slot| slot.status.allocation_id.or(slot.reserved_for))
                .filter_map(|allocation_id| {
                    state
                        .allocation_owner
                        .remove(&allocation_id)
                        .map(|address| (allocation_id, address))
                })
                .collect()
        };
        for (allocation_id, jm_address) in affected {
            if let Some((token, job_master)) = self.jm_resolver.resolve_job_master(&jm_address) {
                let cause = cause.clone();
                tokio::spawn(async move {
                    let _ = job_master
                        .fail_slot(token, resource_id, allocation_id, cause)
                        .await;
                });
            }
        }

        let gateway = entry.gateway;
        let cause_for_te = cause.clone();
        tokio::spawn(async move {
            let _ = gateway.disconnect_resource_manager(cause_for_te).await;
        });
        Ok(Ack)
    }

    async fn heartbeat_from_task_executor(
        &self,
        resource_id: ResourceId,
        slot_report: SlotReport,
    ) -> Result<()> {
        self.heartbeats.receive_heartbeat(resource_id, slot_report);
        Ok(())
    }

    async fn heartbeat_from_job_master(&self, _resource_id: ResourceId) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_core::gateway::RpcRegistry;

    #[tokio::test]
    async fn test_fenced_calls_rejected_before_leadership() {
        let registry = Arc::new(RpcRegistry::new());
        let rm = ResourceManager::new(
            RuntimeConfig::default(),
            Arc::new(NoOpWorkerProvisioner),
            registry.clone(),
            registry,
        );

        let result = rm
            .register_task_executor(
                ResourceManagerId::new(),
                TaskExecutorRegistration {
                    resource_id: ResourceId::new(),
                    address: "te-1".into(),
                    total_resource_profile: ResourceProfile::new(2.0, 512),
                    default_slot_profile: ResourceProfile::new(1.0, 256),
                    num_slots: 2,
                },
            )
            .await;
        assert!(matches!(
            result,
            Err(RuntimeError::FencingTokenMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_unresolvable_worker_is_rejected() {
        let registry = Arc::new(RpcRegistry::new());
        let rm = ResourceManager::new(
            RuntimeConfig::default(),
            Arc::new(NoOpWorkerProvisioner),
            registry.clone(),
            registry,
        );
        let token = ResourceManagerId::new();
        rm.grant_leadership(token);

        let response = rm
            .register_task_executor(
                token,
                TaskExecutorRegistration {
                    resource_id: ResourceId::new(),
                    address: "nowhere".into(),
                    total_resource_profile: ResourceProfile::new(2.0, 512),
                    default_slot_profile: ResourceProfile::new(1.0, 256),
                    num_slots: 2,
                },
            )
            .await
            .unwrap();
        assert!(matches!(response, RegistrationResponse::Rejection { .. }));
    }
}
