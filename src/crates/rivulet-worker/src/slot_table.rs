//! The task executor's slot table.
//!
//! Slots move FREE → ALLOCATED → ACTIVE → RELEASING; a slot holding tasks
//! can never go FREE until the last task is removed, and the sum of all
//! non-FREE slot profiles stays within the worker's declared budget. An
//! ALLOCATED slot that no job master activates within the allocation
//! timeout is reclaimed.

use parking_lot::Mutex;
use rivulet_core::gateway::{SlotReport, SlotStatus};
use rivulet_core::ids::{AllocationId, ExecutionAttemptId, JobId, ResourceId, SlotId};
use rivulet_core::resources::{ResourceBudgetManager, ResourceProfile};
use rivulet_core::state::SlotState;
use rivulet_core::{Result, RuntimeError};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// One slot and everything booked into it.
pub struct TaskSlot {
    pub slot_id: SlotId,
    pub state: SlotState,
    pub job_id: Option<JobId>,
    pub allocation_id: Option<AllocationId>,
    pub resource_profile: ResourceProfile,
    pub tasks: Vec<ExecutionAttemptId>,
    allocated_at: Option<Instant>,
}

impl TaskSlot {
    fn free(slot_id: SlotId, default_profile: ResourceProfile) -> Self {
        Self {
            slot_id,
            state: SlotState::Free,
            job_id: None,
            allocation_id: None,
            resource_profile: default_profile,
            tasks: Vec::new(),
            allocated_at: None,
        }
    }

    fn status(&self) -> SlotStatus {
        SlotStatus {
            slot_id: self.slot_id,
            resource_profile: self.resource_profile.clone(),
            allocation_id: self.allocation_id,
            job_id: self.job_id,
        }
    }
}

/// All slots of one task executor, guarded by one lock.
pub struct TaskSlotTable {
    resource_id: ResourceId,
    default_profile: ResourceProfile,
    budget: ResourceBudgetManager,
    slots: Mutex<Vec<TaskSlot>>,
    /// Attempt → allocation, for task removal without scanning.
    task_index: Mutex<HashMap<ExecutionAttemptId, AllocationId>>,
}

impl TaskSlotTable {
    pub fn new(resource_id: ResourceId, num_slots: u32, default_profile: ResourceProfile) -> Self {
        let mut total = ResourceProfile::unknown();
        for _ in 0..num_slots {
            total = total.add(&default_profile);
        }
        let slots = (0..num_slots)
            .map(|i| TaskSlot::free(SlotId::new(resource_id, i), default_profile.clone()))
            .collect();
        Self {
            resource_id,
            default_profile,
            budget: ResourceBudgetManager::new(total),
            slots: Mutex::new(slots),
            task_index: Mutex::new(HashMap::new()),
        }
    }

    pub fn resource_id(&self) -> ResourceId {
        self.resource_id
    }

    pub fn num_slots(&self) -> u32 {
        self.slots.lock().len() as u32
    }

    pub fn default_profile(&self) -> &ResourceProfile {
        &self.default_profile
    }

    pub fn total_profile(&self) -> ResourceProfile {
        self.budget.total().clone()
    }

    /// Reserve a FREE slot for an allocation. Re-allocating the same
    /// allocation to the same slot is idempotent.
    pub fn allocate(
        &self,
        slot_index: u32,
        job_id: JobId,
        allocation_id: AllocationId,
        resource_profile: ResourceProfile,
    ) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = slots
            .get_mut(slot_index as usize)
            .ok_or_else(|| RuntimeError::other(format!("no slot with index {slot_index}")))?;

        if slot.allocation_id == Some(allocation_id) {
            return Ok(());
        }
        if slot.state != SlotState::Free {
            return Err(RuntimeError::AllocationFailure {
                allocation_id,
                cause: format!("slot {} is {:?}", slot.slot_id, slot.state),
            });
        }

        let profile = if resource_profile.is_unknown() {
            self.default_profile.clone()
        } else {
            resource_profile
        };
        self.budget.reserve(&profile)?;

        slot.state = SlotState::Allocated;
        slot.job_id = Some(job_id);
        slot.allocation_id = Some(allocation_id);
        slot.resource_profile = profile;
        slot.allocated_at = Some(Instant::now());
        debug!(slot = %slot.slot_id, allocation = %allocation_id, job = %job_id, "slot allocated");
        Ok(())
    }

    /// A job master accepted the offer; the slot may now host tasks.
    pub fn mark_active(&self, allocation_id: AllocationId) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = find_allocation(&mut slots, allocation_id)?;
        match slot.state {
            SlotState::Allocated | SlotState::Active => {
                slot.state = SlotState::Active;
                Ok(())
            }
            other => Err(RuntimeError::AllocationFailure {
                allocation_id,
                cause: format!("cannot activate slot in state {other:?}"),
            }),
        }
    }

    pub fn add_task(
        &self,
        allocation_id: AllocationId,
        attempt_id: ExecutionAttemptId,
    ) -> Result<JobId> {
        let mut slots = self.slots.lock();
        let slot = find_allocation(&mut slots, allocation_id)?;
        if slot.state != SlotState::Active {
            return Err(RuntimeError::AllocationFailure {
                allocation_id,
                cause: format!("slot is {:?}, not ACTIVE", slot.state),
            });
        }
        let job_id = slot.job_id.expect("active slot has a job");
        slot.tasks.push(attempt_id);
        self.task_index.lock().insert(attempt_id, allocation_id);
        Ok(job_id)
    }

    /// Remove a finished/canceled/failed task. If its slot was RELEASING and
    /// this was the last task, the slot goes FREE and the freed allocation
    /// is returned.
    pub fn remove_task(&self, attempt_id: ExecutionAttemptId) -> Option<AllocationId> {
        let allocation_id = self.task_index.lock().remove(&attempt_id)?;
        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.allocation_id == Some(allocation_id))?;
        slot.tasks.retain(|t| *t != attempt_id);
        if slot.state == SlotState::Releasing && slot.tasks.is_empty() {
            self.free_slot_inner(slot);
            return Some(allocation_id);
        }
        None
    }

    pub fn tasks_of(&self, allocation_id: AllocationId) -> Vec<ExecutionAttemptId> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.allocation_id == Some(allocation_id))
            .map(|s| s.tasks.clone())
            .unwrap_or_default()
    }

    pub fn allocation_of_task(&self, attempt_id: ExecutionAttemptId) -> Option<AllocationId> {
        self.task_index.lock().get(&attempt_id).copied()
    }

    pub fn job_of_allocation(&self, allocation_id: AllocationId) -> Option<JobId> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.allocation_id == Some(allocation_id))
            .and_then(|s| s.job_id)
    }

    pub fn has_allocation(&self, allocation_id: AllocationId) -> bool {
        self.slots
            .lock()
            .iter()
            .any(|s| s.allocation_id == Some(allocation_id))
    }

    /// Free a slot, or mark it RELEASING while tasks still run in it.
    /// Returns true once the slot is actually FREE.
    pub fn try_free(&self, allocation_id: AllocationId, cause: &str) -> Result<bool> {
        let mut slots = self.slots.lock();
        let slot = find_allocation(&mut slots, allocation_id)?;
        if slot.tasks.is_empty() {
            info!(slot = %slot.slot_id, allocation = %allocation_id, cause, "freeing slot");
            self.free_slot_inner(slot);
            Ok(true)
        } else {
            debug!(slot = %slot.slot_id, allocation = %allocation_id, "slot releasing, tasks still running");
            slot.state = SlotState::Releasing;
            Ok(false)
        }
    }

    /// Reclaim ALLOCATED slots no job master activated within `timeout`.
    pub fn check_allocation_timeouts(&self, timeout: Duration) -> Vec<AllocationId> {
        let mut freed = Vec::new();
        let mut slots = self.slots.lock();
        for slot in slots.iter_mut() {
            if slot.state == SlotState::Allocated {
                if let (Some(at), Some(allocation_id)) = (slot.allocated_at, slot.allocation_id) {
                    if at.elapsed() >= timeout {
                        info!(slot = %slot.slot_id, allocation = %allocation_id, "allocation timed out");
                        self.free_slot_inner(slot);
                        freed.push(allocation_id);
                    }
                }
            }
        }
        freed
    }

    /// Snapshot of every slot, reported to the resource manager.
    pub fn slot_report(&self) -> SlotReport {
        SlotReport::new(self.slots.lock().iter().map(|s| s.status()).collect())
    }

    pub fn state_of(&self, allocation_id: AllocationId) -> Option<SlotState> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.allocation_id == Some(allocation_id))
            .map(|s| s.state)
    }

    fn free_slot_inner(&self, slot: &mut TaskSlot) {
        self.budget.release(&slot.resource_profile);
        let mut task_index = self.task_index.lock();
        for task in &slot.tasks {
            task_index.remove(task);
        }
        slot.state = SlotState::Free;
        slot.job_id = None;
        slot.allocation_id = None;
        slot.resource_profile = self.default_profile.clone();
        slot.tasks.clear();
        slot.allocated_at = None;
    }
}

fn find_allocation(
    slots: &mut [TaskSlot],
    allocation_id: AllocationId,
) -> Result<&mut TaskSlot> {
    slots
        .iter_mut()
        .find(|s| s.allocation_id == Some(allocation_id))
        .ok_or(RuntimeError::AllocationFailure {
            allocation_id,
            cause: "allocation not known to this task executor".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> TaskSlotTable {
        TaskSlotTable::new(ResourceId::new(), 2, ResourceProfile::new(1.0, 256))
    }

    #[test]
    fn test_allocate_activate_free_cycle() {
        let table = table();
        let allocation = AllocationId::new();
        let job = JobId::new();

        table
            .allocate(0, job, allocation, ResourceProfile::new(1.0, 256))
            .unwrap();
        assert_eq!(table.state_of(allocation), Some(SlotState::Allocated));

        table.mark_active(allocation).unwrap();
        assert_eq!(table.state_of(allocation), Some(SlotState::Active));

        assert!(table.try_free(allocation, "test").unwrap());
        assert!(!table.has_allocation(allocation));
        assert_eq!(table.slot_report().num_free(), 2);
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let table = table();
        let allocation = AllocationId::new();
        let job = JobId::new();

        table
            .allocate(0, job, allocation, ResourceProfile::new(1.0, 256))
            .unwrap();
        table
            .allocate(0, job, allocation, ResourceProfile::new(1.0, 256))
            .unwrap();
        // Budget reserved once: the second slot still fits.
        table
            .allocate(1, job, AllocationId::new(), ResourceProfile::new(1.0, 256))
            .unwrap();
    }

    #[test]
    fn test_allocated_slot_rejects_other_allocations() {
        let table = table();
        let job = JobId::new();
        table
            .allocate(0, job, AllocationId::new(), ResourceProfile::new(1.0, 256))
            .unwrap();
        assert!(table
            .allocate(0, job, AllocationId::new(), ResourceProfile::new(1.0, 256))
            .is_err());
    }

    #[test]
    fn test_budget_rejects_oversized_profiles() {
        let table = table();
        assert!(matches!(
            table.allocate(
                0,
                JobId::new(),
                AllocationId::new(),
                ResourceProfile::new(8.0, 1 << 40)
            ),
            Err(RuntimeError::ResourceOverallocation(_))
        ));
    }

    #[test]
    fn test_slot_with_tasks_cannot_go_free() {
        let table = table();
        let allocation = AllocationId::new();
        let attempt = ExecutionAttemptId::new();

        table
            .allocate(0, JobId::new(), allocation, ResourceProfile::new(1.0, 256))
            .unwrap();
        table.mark_active(allocation).unwrap();
        table.add_task(allocation, attempt).unwrap();

        assert!(!table.try_free(allocation, "test").unwrap());
        assert_eq!(table.state_of(allocation), Some(SlotState::Releasing));

        // Removing the last task completes the release.
        assert_eq!(table.remove_task(attempt), Some(allocation));
        assert!(!table.has_allocation(allocation));
    }

    #[test]
    fn test_tasks_require_active_slot() {
        let table = table();
        let allocation = AllocationId::new();
        table
            .allocate(0, JobId::new(), allocation, ResourceProfile::new(1.0, 256))
            .unwrap();
        // Still ALLOCATED, not ACTIVE.
        assert!(table.add_task(allocation, ExecutionAttemptId::new()).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allocation_timeout_reclaims_inactive_slots() {
        let table = table();
        let stale = AllocationId::new();
        let active = AllocationId::new();

        table
            .allocate(0, JobId::new(), stale, ResourceProfile::new(1.0, 256))
            .unwrap();
        table
            .allocate(1, JobId::new(), active, ResourceProfile::new(1.0, 256))
            .unwrap();
        table.mark_active(active).unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;

        let freed = table.check_allocation_timeouts(Duration::from_secs(30));
        assert_eq!(freed, vec![stale]);
        assert!(table.has_allocation(active));
        assert_eq!(table.slot_report().num_free(), 1);
    }
}
