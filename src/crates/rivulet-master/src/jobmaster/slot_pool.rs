//! The job-master-side slot pool: broker between the scheduler and the
//! resource manager.
//!
//! The pool owns logical handles to allocated slots; returning a handle
//! releases the allocation at the worker. Requests the resource manager is
//! unreachable for are parked and re-sent on reconnect. Streaming requests
//! time out on wall time from submission; batch requests only time out once
//! they have been continuously unfulfillable, measured against the profiles
//! of slots the pool itself holds, never against the resource manager's
//! view.

use parking_lot::Mutex;
use rivulet_core::config::RuntimeConfig;
use rivulet_core::gateway::{ResourceManagerGateway, SlotOffer, SlotRequestBody};
use rivulet_core::ids::{
    AllocationId, JobId, JobMasterId, ResourceId, ResourceManagerId, SlotId, SlotRequestId,
};
use rivulet_core::resources::ResourceProfile;
use rivulet_core::{Result, RuntimeError};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A logical handle to one slot on one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocatedSlot {
    pub allocation_id: AllocationId,
    pub slot_id: SlotId,
    pub resource_profile: ResourceProfile,
}

impl AllocatedSlot {
    pub fn resource_id(&self) -> ResourceId {
        self.slot_id.resource_id
    }
}

/// Completes with the slot, or with the failure that ended the request.
pub type SlotFuture = oneshot::Receiver<Result<AllocatedSlot>>;

struct PendingRequest {
    slot_request_id: SlotRequestId,
    allocation_id: AllocationId,
    resource_profile: ResourceProfile,
    is_batch: bool,
    sender: oneshot::Sender<Result<AllocatedSlot>>,
    unfulfillable_since: Option<Instant>,
    timeout_task: Option<tokio::task::JoinHandle<()>>,
}

impl PendingRequest {
    fn complete(mut self, result: Result<AllocatedSlot>) {
        if let Some(task) = self.timeout_task.take() {
            task.abort();
        }
        let _ = self.sender.send(result);
    }
}

struct PoolState {
    resource_manager: Option<(ResourceManagerId, Arc<dyn ResourceManagerGateway>)>,
    registered_task_managers: HashSet<ResourceId>,
    /// Insertion-ordered: the Vec front is the oldest.
    available_slots: Vec<(AllocatedSlot, Instant)>,
    allocated_slots: HashMap<AllocationId, AllocatedSlot>,
    request_of_allocation: HashMap<AllocationId, SlotRequestId>,
    allocation_of_request: HashMap<SlotRequestId, AllocationId>,
    /// Requests already sent to the resource manager, insertion order.
    pending_requests: Vec<PendingRequest>,
    /// Requests parked because the resource manager is unreachable.
    waiting_for_resource_manager: Vec<PendingRequest>,
}

impl PoolState {
    fn remove_request(&mut self, slot_request_id: SlotRequestId) -> Option<PendingRequest> {
        if let Some(pos) = self
            .pending_requests
            .iter()
            .position(|r| r.slot_request_id == slot_request_id)
        {
            return Some(self.pending_requests.remove(pos));
        }
        if let Some(pos) = self
            .waiting_for_resource_manager
            .iter()
            .position(|r| r.slot_request_id == slot_request_id)
        {
            return Some(self.waiting_for_resource_manager.remove(pos));
        }
        None
    }

    fn remove_request_by_allocation(
        &mut self,
        allocation_id: AllocationId,
    ) -> Option<PendingRequest> {
        if let Some(pos) = self
            .pending_requests
            .iter()
            .position(|r| r.allocation_id == allocation_id)
        {
            return Some(self.pending_requests.remove(pos));
        }
        if let Some(pos) = self
            .waiting_for_resource_manager
            .iter()
            .position(|r| r.allocation_id == allocation_id)
        {
            return Some(self.waiting_for_resource_manager.remove(pos));
        }
        None
    }

    /// First queued request the slot can satisfy: pending first, then
    /// parked, in insertion order each.
    fn take_matching_request(&mut self, slot: &AllocatedSlot) -> Option<PendingRequest> {
        if let Some(pos) = self
            .pending_requests
            .iter()
            .position(|r| slot.resource_profile.matches(&r.resource_profile))
        {
            return Some(self.pending_requests.remove(pos));
        }
        if let Some(pos) = self
            .waiting_for_resource_manager
            .iter()
            .position(|r| slot.resource_profile.matches(&r.resource_profile))
        {
            return Some(self.waiting_for_resource_manager.remove(pos));
        }
        None
    }

    /// Oldest matching available slot; a location preference is soft and
    /// only breaks ties in favour of the preferred worker.
    fn take_matching_available(
        &mut self,
        profile: &ResourceProfile,
        preference: Option<ResourceId>,
    ) -> Option<AllocatedSlot> {
        if let Some(preferred) = preference {
            if let Some(pos) = self.available_slots.iter().position(|(slot, _)| {
                slot.resource_id() == preferred && slot.resource_profile.matches(profile)
            }) {
                return Some(self.available_slots.remove(pos).0);
            }
        }
        let pos = self
            .available_slots
            .iter()
            .position(|(slot, _)| slot.resource_profile.matches(profile))?;
        Some(self.available_slots.remove(pos).0)
    }

    fn contains_allocation(&self, allocation_id: AllocationId) -> Option<&AllocatedSlot> {
        self.allocated_slots.get(&allocation_id).or_else(|| {
            self.available_slots
                .iter()
                .find(|(slot, _)| slot.allocation_id == allocation_id)
                .map(|(slot, _)| slot)
        })
    }

    fn fulfill(&mut self, request: PendingRequest, slot: AllocatedSlot) {
        self.request_of_allocation
            .insert(slot.allocation_id, request.slot_request_id);
        self.allocation_of_request
            .insert(request.slot_request_id, slot.allocation_id);
        self.allocated_slots.insert(slot.allocation_id, slot.clone());
        debug!(
            request = %request.slot_request_id,
            allocation = %slot.allocation_id,
            "slot request fulfilled"
        );
        request.complete(Ok(slot));
    }
}

/// One pool per job master.
pub struct SlotPool {
    job_id: JobId,
    job_master_address: String,
    config: RuntimeConfig,
    job_master_id: Mutex<Option<JobMasterId>>,
    state: Mutex<PoolState>,
}

impl SlotPool {
    pub fn new(job_id: JobId, job_master_address: impl Into<String>, config: RuntimeConfig) -> Arc<Self> {
        Arc::new(Self {
            job_id,
            job_master_address: job_master_address.into(),
            config,
            job_master_id: Mutex::new(None),
            state: Mutex::new(PoolState {
                resource_manager: None,
                registered_task_managers: HashSet::new(),
                available_slots: Vec::new(),
                allocated_slots: HashMap::new(),
                request_of_allocation: HashMap::new(),
                allocation_of_request: HashMap::new(),
                pending_requests: Vec::new(),
                waiting_for_resource_manager: Vec::new(),
            }),
        })
    }

    pub fn start(&self, job_master_id: JobMasterId) {
        *self.job_master_id.lock() = Some(job_master_id);
    }

    /// Connect to the resource manager and flush parked requests.
    pub fn connect_to_resource_manager(
        self: &Arc<Self>,
        resource_manager_id: ResourceManagerId,
        gateway: Arc<dyn ResourceManagerGateway>,
    ) {
        let to_send: Vec<(AllocationId, ResourceProfile)>;
        {
            let mut state = self.state.lock();
            state.resource_manager = Some((resource_manager_id, Arc::clone(&gateway)));
            let mut parked = std::mem::take(&mut state.waiting_for_resource_manager);
            to_send = parked
                .iter()
                .map(|r| (r.allocation_id, r.resource_profile.clone()))
                .collect();
            state.pending_requests.append(&mut parked);
        }
        for (allocation_id, profile) in to_send {
            self.send_request_to_rm(allocation_id, profile);
        }
    }

    /// The resource manager became unreachable. Pending requests are parked
    /// again; batch requests fail immediately only when configured to.
    pub fn disconnect_resource_manager(&self) {
        let mut state = self.state.lock();
        state.resource_manager = None;
        let mut pending = std::mem::take(&mut state.pending_requests);
        if self.config.slot_pool.batch_request_fails_on_rm_failure {
            let (batch, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|r| r.is_batch);
            for request in batch {
                request.complete(Err(RuntimeError::Rpc(
                    "resource manager connection lost".into(),
                )));
            }
            pending = rest;
        }
        state.waiting_for_resource_manager.append(&mut pending);
    }

    pub fn register_task_manager(&self, resource_id: ResourceId) -> bool {
        self.state.lock().registered_task_managers.insert(resource_id)
    }

    /// Fail every allocation from this worker. Returns the failed
    /// allocations so the caller can fail the executions using them.
    pub fn release_task_manager(&self, resource_id: ResourceId, cause: &str) -> Vec<AllocationId> {
        let mut state = self.state.lock();
        if !state.registered_task_managers.remove(&resource_id) {
            return Vec::new();
        }
        info!(worker = %resource_id, cause, "releasing task manager from pool");

        state
            .available_slots
            .retain(|(slot, _)| slot.resource_id() != resource_id);

        let failed: Vec<AllocationId> = state
            .allocated_slots
            .values()
            .filter(|slot| slot.resource_id() == resource_id)
            .map(|slot| slot.allocation_id)
            .collect();
        for allocation_id in &failed {
            state.allocated_slots.remove(allocation_id);
            if let Some(request_id) = state.request_of_allocation.remove(allocation_id) {
                state.allocation_of_request.remove(&request_id);
            }
        }
        failed
    }

    /// Streaming slot request: timeout runs on wall time from submission.
    /// `preference` is a soft locality hint from upstream producers.
    pub fn request_new_allocated_slot(
        self: &Arc<Self>,
        slot_request_id: SlotRequestId,
        resource_profile: ResourceProfile,
        preference: Option<ResourceId>,
        timeout: Duration,
    ) -> SlotFuture {
        self.request_slot_internal(slot_request_id, resource_profile, preference, false, Some(timeout))
    }

    /// Batch slot request: only unfulfillability is deadline-relevant.
    pub fn request_new_allocated_batch_slot(
        self: &Arc<Self>,
        slot_request_id: SlotRequestId,
        resource_profile: ResourceProfile,
    ) -> SlotFuture {
        self.request_slot_internal(slot_request_id, resource_profile, None, true, None)
    }

    fn request_slot_internal(
        self: &Arc<Self>,
        slot_request_id: SlotRequestId,
        resource_profile: ResourceProfile,
        preference: Option<ResourceId>,
        is_batch: bool,
        timeout: Option<Duration>,
    ) -> SlotFuture {
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();

        // Reuse an idle slot when one fits; oldest first.
        if let Some(slot) = state.take_matching_available(&resource_profile, preference) {
            state.fulfill(
                PendingRequest {
                    slot_request_id,
                    allocation_id: slot.allocation_id,
                    resource_profile,
                    is_batch,
                    sender: tx,
                    unfulfillable_since: None,
                    timeout_task: None,
                },
                slot,
            );
            return rx;
        }

        let allocation_id = AllocationId::new();
        let timeout_task = timeout.map(|timeout| {
            let pool = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                pool.timeout_request(slot_request_id, timeout);
            })
        });

        let request = PendingRequest {
            slot_request_id,
            allocation_id,
            resource_profile: resource_profile.clone(),
            is_batch,
            sender: tx,
            unfulfillable_since: None,
            timeout_task,
        };

        let connected = state.resource_manager.is_some();
        if connected {
            state.pending_requests.push(request);
        } else {
            debug!(request = %slot_request_id, "resource manager unreachable, parking request");
            state.waiting_for_resource_manager.push(request);
        }
        drop(state);

        if connected {
            self.send_request_to_rm(allocation_id, resource_profile);
        }
        rx
    }

    fn send_request_to_rm(self: &Arc<Self>, allocation_id: AllocationId, profile: ResourceProfile) {
        let (rm_id, gateway) = {
            let state = self.state.lock();
            match &state.resource_manager {
                Some((id, gw)) => (*id, Arc::clone(gw)),
                None => return,
            }
        };
        let Some(job_master_id) = *self.job_master_id.lock() else {
            return;
        };
        let body = SlotRequestBody {
            job_id: self.job_id,
            allocation_id,
            resource_profile: profile,
            job_master_address: self.job_master_address.clone(),
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = gateway.request_slot(rm_id, job_master_id, body).await {
                pool.on_rm_request_failure(allocation_id, e);
            }
        });
    }

    fn on_rm_request_failure(&self, allocation_id: AllocationId, error: RuntimeError) {
        let mut state = self.state.lock();
        let Some(pos) = state
            .pending_requests
            .iter()
            .position(|r| r.allocation_id == allocation_id)
        else {
            return;
        };
        let fail_batch = self.config.slot_pool.batch_request_fails_on_rm_failure;
        if state.pending_requests[pos].is_batch && !fail_batch {
            // Batch requests ride out resource manager failures; the batch
            // timeout is the only thing that ends them.
            warn!(allocation = %allocation_id, "ignoring RM failure for batch request: {error}");
            return;
        }
        let request = state.pending_requests.remove(pos);
        request.complete(Err(error));
    }

    fn timeout_request(&self, slot_request_id: SlotRequestId, timeout: Duration) {
        let (request, rm) = {
            let mut state = self.state.lock();
            let request = state.remove_request(slot_request_id);
            let rm = state.resource_manager.clone();
            (request, rm)
        };
        let Some(request) = request else {
            // Fulfillment won the race; nothing to do.
            return;
        };
        warn!(request = %slot_request_id, "slot request timed out");
        let allocation_id = request.allocation_id;
        request.complete(Err(RuntimeError::SlotRequestTimeout {
            timeout_ms: timeout.as_millis() as u64,
        }));
        if let Some((rm_id, gateway)) = rm {
            tokio::spawn(async move {
                let _ = gateway.cancel_slot_request(rm_id, allocation_id).await;
            });
        }
    }

    /// A worker offers slots. Returns the accepted subset.
    pub fn offer_slots(&self, resource_id: ResourceId, offers: Vec<SlotOffer>) -> Vec<SlotOffer> {
        let mut state = self.state.lock();
        if !state.registered_task_managers.contains(&resource_id) {
            warn!(worker = %resource_id, "rejecting offers from unregistered task manager");
            return Vec::new();
        }

        let mut accepted = Vec::new();
        for offer in offers {
            let slot_id = SlotId::new(resource_id, offer.slot_index);

            if let Some(existing) = state.contains_allocation(offer.allocation_id) {
                if existing.slot_id == slot_id {
                    // Idempotent re-offer.
                    accepted.push(offer);
                } else {
                    warn!(
                        allocation = %offer.allocation_id,
                        "rejecting offer: allocation known under a different slot"
                    );
                }
                continue;
            }

            let slot = AllocatedSlot {
                allocation_id: offer.allocation_id,
                slot_id,
                resource_profile: offer.resource_profile.clone(),
            };

            // Prefer the request this allocation was minted for, then any
            // queued request the slot satisfies.
            let request = state
                .remove_request_by_allocation(offer.allocation_id)
                .or_else(|| state.take_matching_request(&slot));

            match request {
                Some(request) => state.fulfill(request, slot),
                None => state.available_slots.push((slot, Instant::now())),
            }
            accepted.push(offer);
        }
        accepted
    }

    /// Return a slot obtained through `slot_request_id`, or cancel the
    /// request if it is still queued.
    pub fn release_slot(self: &Arc<Self>, slot_request_id: SlotRequestId, cause: &str) {
        let mut state = self.state.lock();

        if let Some(request) = state.remove_request(slot_request_id) {
            let allocation_id = request.allocation_id;
            request.complete(Err(RuntimeError::other(format!(
                "slot request released: {cause}"
            ))));
            if let Some((rm_id, gateway)) = state.resource_manager.clone() {
                tokio::spawn(async move {
                    let _ = gateway.cancel_slot_request(rm_id, allocation_id).await;
                });
            }
            return;
        }

        let Some(allocation_id) = state.allocation_of_request.remove(&slot_request_id) else {
            return;
        };
        state.request_of_allocation.remove(&allocation_id);
        let Some(slot) = state.allocated_slots.remove(&allocation_id) else {
            return;
        };

        // A freed slot first serves another queued request.
        match state.take_matching_request(&slot) {
            Some(request) => state.fulfill(request, slot),
            None => state.available_slots.push((slot, Instant::now())),
        }
    }

    /// Fail one allocation. Returns the owning worker if the pool now holds
    /// nothing from it, so the caller may disconnect the worker.
    pub fn fail_allocation(
        &self,
        allocation_id: AllocationId,
        cause: &str,
    ) -> Option<ResourceId> {
        let mut state = self.state.lock();

        if let Some(request) = state.remove_request_by_allocation(allocation_id) {
            request.complete(Err(RuntimeError::AllocationFailure {
                allocation_id,
                cause: cause.to_string(),
            }));
            return None;
        }

        let resource_id = state.contains_allocation(allocation_id)?.resource_id();
        state
            .available_slots
            .retain(|(slot, _)| slot.allocation_id != allocation_id);
        state.allocated_slots.remove(&allocation_id);
        if let Some(request_id) = state.request_of_allocation.remove(&allocation_id) {
            state.allocation_of_request.remove(&request_id);
        }

        let still_tracked = state
            .allocated_slots
            .values()
            .any(|slot| slot.resource_id() == resource_id)
            || state
                .available_slots
                .iter()
                .any(|(slot, _)| slot.resource_id() == resource_id);
        (!still_tracked).then_some(resource_id)
    }

    /// Release slots idle for longer than the configured timeout. Returns
    /// the released slots so the caller frees them at their workers.
    pub fn check_idle_slots(&self) -> Vec<AllocatedSlot> {
        let idle_timeout = self.config.idle_slot_timeout();
        let mut state = self.state.lock();
        let now = Instant::now();
        let (expired, kept): (Vec<_>, Vec<_>) = state
            .available_slots
            .drain(..)
            .partition(|(_, since)| now.duration_since(*since) >= idle_timeout);
        state.available_slots = kept;
        expired
            .into_iter()
            .map(|(slot, _)| {
                info!(allocation = %slot.allocation_id, "releasing idle slot");
                slot
            })
            .collect()
    }

    /// Fail batch requests that have been continuously unfulfillable for
    /// longer than the batch timeout. Fulfillability is judged against the
    /// union of profiles allocated or available in this pool.
    pub fn check_batch_slot_timeout(&self) {
        let batch_timeout = self.config.batch_slot_timeout();
        let mut state = self.state.lock();
        let now = Instant::now();

        let profiles: Vec<ResourceProfile> = state
            .allocated_slots
            .values()
            .map(|s| s.resource_profile.clone())
            .chain(
                state
                    .available_slots
                    .iter()
                    .map(|(s, _)| s.resource_profile.clone()),
            )
            .collect();

        let mut timed_out = Vec::new();
        fn sweep_queue(
            queue: &mut Vec<PendingRequest>,
            profiles: &[ResourceProfile],
            now: Instant,
            batch_timeout: std::time::Duration,
            timed_out: &mut Vec<PendingRequest>,
        ) {
            let mut index = 0;
            while index < queue.len() {
                let request = &mut queue[index];
                if !request.is_batch {
                    index += 1;
                    continue;
                }
                let fulfillable = profiles
                    .iter()
                    .any(|p| p.matches(&request.resource_profile));
                if fulfillable {
                    request.unfulfillable_since = None;
                    index += 1;
                } else {
                    let since = *request.unfulfillable_since.get_or_insert(now);
                    if now.duration_since(since) >= batch_timeout {
                        timed_out.push(queue.remove(index));
                    } else {
                        index += 1;
                    }
                }
            }
        }
        sweep_queue(
            &mut state.pending_requests,
            &profiles,
            now,
            batch_timeout,
            &mut timed_out,
        );
        sweep_queue(
            &mut state.waiting_for_resource_manager,
            &profiles,
            now,
            batch_timeout,
            &mut timed_out,
        );

        let timeout_ms = batch_timeout.as_millis() as u64;
        for request in timed_out {
            warn!(request = %request.slot_request_id, "batch slot request unfulfillable for too long");
            request.complete(Err(RuntimeError::SlotRequestTimeout { timeout_ms }));
        }
    }

    /// Drain every slot the pool still holds, for job teardown. The caller
    /// frees them at their workers.
    pub fn release_all(&self) -> Vec<AllocatedSlot> {
        let mut state = self.state.lock();
        let mut slots: Vec<AllocatedSlot> =
            state.available_slots.drain(..).map(|(slot, _)| slot).collect();
        slots.extend(state.allocated_slots.drain().map(|(_, slot)| slot));
        state.request_of_allocation.clear();
        state.allocation_of_request.clear();
        slots
    }

    pub fn num_available(&self) -> usize {
        self.state.lock().available_slots.len()
    }

    pub fn num_allocated(&self) -> usize {
        self.state.lock().allocated_slots.len()
    }

    pub fn num_pending(&self) -> usize {
        let state = self.state.lock();
        state.pending_requests.len() + state.waiting_for_resource_manager.len()
    }

    /// Invariant check: available and allocated are disjoint on allocation
    /// id, and every tracked slot belongs to a registered worker.
    pub fn check_invariants(&self) -> bool {
        let state = self.state.lock();
        let available: HashSet<AllocationId> = state
            .available_slots
            .iter()
            .map(|(s, _)| s.allocation_id)
            .collect();
        let disjoint = !state
            .allocated_slots
            .keys()
            .any(|id| available.contains(id));
        let owned = state
            .available_slots
            .iter()
            .map(|(s, _)| s)
            .chain(state.allocated_slots.values())
            .all(|s| state.registered_task_managers.contains(&s.resource_id()));
        disjoint && owned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use rivulet_core::gateway::{
        Ack, RegistrationResponse, SlotReport, TaskExecutorRegistration,
    };
    use rivulet_core::ids::RegistrationId;

    #[derive(Default)]
    struct RecordingRm {
        requests: PlMutex<Vec<AllocationId>>,
        cancels: PlMutex<Vec<AllocationId>>,
    }

    #[async_trait]
    impl ResourceManagerGateway for RecordingRm {
        async fn register_task_executor(
            &self,
            _resource_manager_id: ResourceManagerId,
            _registration: TaskExecutorRegistration,
        ) -> Result<RegistrationResponse> {
            Ok(RegistrationResponse::Success {
                registration_id: RegistrationId::new(),
            })
        }

        async fn send_slot_report(
            &self,
            _resource_manager_id: ResourceManagerId,
            _resource_id: ResourceId,
            _registration_id: RegistrationId,
            _slot_report: SlotReport,
        ) -> Result<Ack> {
            Ok(Ack)
        }

        async fn request_slot(
            &self,
            _resource_manager_id: ResourceManagerId,
            _job_master_id: JobMasterId,
            request: SlotRequestBody,
        ) -> Result<Ack> {
            self.requests.lock().push(request.allocation_id);
            Ok(Ack)
        }

        async fn cancel_slot_request(
            &self,
            _resource_manager_id: ResourceManagerId,
            allocation_id: AllocationId,
        ) -> Result<Ack> {
            self.cancels.lock().push(allocation_id);
            Ok(Ack)
        }

        async fn disconnect_task_executor(
            &self,
            _resource_id: ResourceId,
            _cause: String,
        ) -> Result<Ack> {
            Ok(Ack)
        }

        async fn heartbeat_from_task_executor(
            &self,
            _resource_id: ResourceId,
            _slot_report: SlotReport,
        ) -> Result<()> {
            Ok(())
        }

        async fn heartbeat_from_job_master(&self, _resource_id: ResourceId) -> Result<()> {
            Ok(())
        }
    }

    fn pool_with_rm() -> (Arc<SlotPool>, Arc<RecordingRm>) {
        let config = RuntimeConfig {
            idle_slot_timeout_ms: 50,
            batch_slot_timeout_ms: 100,
            ..Default::default()
        };
        let pool = SlotPool::new(JobId::new(), "jm-test", config);
        pool.start(JobMasterId::new());
        let rm = Arc::new(RecordingRm::default());
        pool.connect_to_resource_manager(ResourceManagerId::new(), rm.clone());
        (pool, rm)
    }

    fn offer(index: u32) -> SlotOffer {
        SlotOffer {
            allocation_id: AllocationId::new(),
            slot_index: index,
            resource_profile: ResourceProfile::new(1.0, 256),
        }
    }

    #[tokio::test]
    async fn test_offer_fulfills_pending_request() {
        let (pool, rm) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let future = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        tokio::task::yield_now().await;
        assert_eq!(rm.requests.lock().len(), 1);

        let accepted = pool.offer_slots(worker, vec![offer(0)]);
        assert_eq!(accepted.len(), 1);

        let slot = future.await.unwrap().unwrap();
        assert_eq!(slot.slot_id.resource_id, worker);
        assert_eq!(pool.num_allocated(), 1);
        assert_eq!(pool.num_available(), 0);
        assert!(pool.check_invariants());
    }

    #[tokio::test]
    async fn test_offer_from_unregistered_worker_is_rejected() {
        let (pool, _) = pool_with_rm();
        let accepted = pool.offer_slots(ResourceId::new(), vec![offer(0)]);
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_offer_is_idempotent() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let o = offer(0);
        let first = pool.offer_slots(worker, vec![o.clone()]);
        let second = pool.offer_slots(worker, vec![o.clone()]);
        assert_eq!(first, second);
        assert_eq!(pool.num_available(), 1);
        assert!(pool.check_invariants());
    }

    #[tokio::test]
    async fn test_same_allocation_different_slot_is_rejected() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let o = offer(0);
        pool.offer_slots(worker, vec![o.clone()]);

        let mut moved = o.clone();
        moved.slot_index = 1;
        let accepted = pool.offer_slots(worker, vec![moved]);
        assert!(accepted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_request_times_out_and_cancels_at_rm() {
        let (pool, rm) = pool_with_rm();

        let future = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_millis(100),
        );
        tokio::time::advance(Duration::from_millis(150)).await;
        tokio::task::yield_now().await;

        assert!(matches!(
            future.await.unwrap(),
            Err(RuntimeError::SlotRequestTimeout { .. })
        ));
        tokio::task::yield_now().await;
        assert_eq!(rm.cancels.lock().len(), 1);
        assert_eq!(pool.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_available_slot_reused_before_asking_rm() {
        let (pool, rm) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);
        pool.offer_slots(worker, vec![offer(0)]);
        assert_eq!(pool.num_available(), 1);

        let future = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        let slot = future.await.unwrap().unwrap();
        assert_eq!(slot.slot_id.resource_id, worker);
        tokio::task::yield_now().await;
        assert!(rm.requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_release_reuses_freed_slot_for_queued_request() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let first_id = SlotRequestId::new();
        let first = pool.request_new_allocated_slot(
            first_id,
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        pool.offer_slots(worker, vec![offer(0)]);
        let slot = first.await.unwrap().unwrap();

        // Second request queues; only one slot exists.
        let second = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        assert_eq!(pool.num_pending(), 1);

        pool.release_slot(first_id, "task finished");
        let reused = second.await.unwrap().unwrap();
        assert_eq!(reused.allocation_id, slot.allocation_id);
        assert_eq!(pool.num_pending(), 0);
        assert!(pool.check_invariants());
    }

    #[tokio::test]
    async fn test_requests_fulfilled_in_submission_order() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let first = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        let mut second = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );

        // One freshly offered slot with an unrelated allocation id.
        pool.offer_slots(worker, vec![offer(0)]);

        let slot = first.await.unwrap().unwrap();
        assert_eq!(slot.slot_id.slot_index, 0);
        assert!(second.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_slots_are_reclaimed() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);
        pool.offer_slots(worker, vec![offer(0)]);

        tokio::time::advance(Duration::from_millis(60)).await;
        let released = pool.check_idle_slots();
        assert_eq!(released.len(), 1);
        assert_eq!(pool.num_available(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_request_times_out_only_when_unfulfillable() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);
        // A held slot whose profile covers the batch request keeps it
        // fulfillable even though the slot is busy.
        let holder = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(100),
        );
        pool.offer_slots(worker, vec![offer(0)]);
        holder.await.unwrap().unwrap();

        let mut fulfillable =
            pool.request_new_allocated_batch_slot(SlotRequestId::new(), ResourceProfile::new(1.0, 256));
        let unfulfillable =
            pool.request_new_allocated_batch_slot(SlotRequestId::new(), ResourceProfile::new(64.0, 1 << 40));

        // First check marks the unfulfillable onset, the second one expires
        // it once the timeout elapsed.
        pool.check_batch_slot_timeout();
        tokio::time::advance(Duration::from_millis(150)).await;
        pool.check_batch_slot_timeout();

        assert!(matches!(
            unfulfillable.await.unwrap(),
            Err(RuntimeError::SlotRequestTimeout { .. })
        ));
        assert!(fulfillable.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_fail_allocation_reports_empty_worker() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let o1 = offer(0);
        let o2 = offer(1);
        pool.offer_slots(worker, vec![o1.clone(), o2.clone()]);

        assert_eq!(pool.fail_allocation(o1.allocation_id, "lost"), None);
        assert_eq!(
            pool.fail_allocation(o2.allocation_id, "lost"),
            Some(worker)
        );
    }

    #[tokio::test]
    async fn test_release_task_manager_fails_its_allocations() {
        let (pool, _) = pool_with_rm();
        let worker = ResourceId::new();
        pool.register_task_manager(worker);

        let request_id = SlotRequestId::new();
        let future = pool.request_new_allocated_slot(
            request_id,
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        pool.offer_slots(worker, vec![offer(0)]);
        let slot = future.await.unwrap().unwrap();

        let failed = pool.release_task_manager(worker, "heartbeat timeout");
        assert_eq!(failed, vec![slot.allocation_id]);
        assert_eq!(pool.num_allocated(), 0);
    }

    #[tokio::test]
    async fn test_parked_requests_flushed_on_reconnect() {
        let config = RuntimeConfig::default();
        let pool = SlotPool::new(JobId::new(), "jm-test", config);
        pool.start(JobMasterId::new());

        // Not connected yet: request parks.
        let _future = pool.request_new_allocated_slot(
            SlotRequestId::new(),
            ResourceProfile::new(1.0, 256),
            None,
            Duration::from_secs(10),
        );
        assert_eq!(pool.num_pending(), 1);

        let rm = Arc::new(RecordingRm::default());
        pool.connect_to_resource_manager(ResourceManagerId::new(), rm.clone());
        tokio::task::yield_now().await;
        assert_eq!(rm.requests.lock().len(), 1);
    }
}
