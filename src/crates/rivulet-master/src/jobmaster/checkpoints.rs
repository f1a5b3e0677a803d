//! The checkpoint coordinator: drives periodic consistent snapshots of one
//! job.

use parking_lot::Mutex;
use rivulet_checkpoint::{
    CheckpointBarrier, CheckpointId, CheckpointMetrics, CheckpointOptions, CompletedCheckpoint,
    CompletedCheckpointStore, CheckpointStorage, DeclineReason, OperatorState, TaskStateSnapshot,
};
use rivulet_core::config::CheckpointSettings;
use rivulet_core::ha::CheckpointIdCounter;
use rivulet_core::ids::{ExecutionAttemptId, JobId};
use rivulet_core::{Result, RuntimeError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One checkpoint the coordinator is waiting on.
pub struct PendingCheckpoint {
    pub checkpoint_id: CheckpointId,
    pub trigger_timestamp: i64,
    deadline: Instant,
    expected_acks: HashSet<ExecutionAttemptId>,
    received_acks: HashSet<ExecutionAttemptId>,
    operator_states: HashMap<rivulet_checkpoint::OperatorId, OperatorState>,
}

impl PendingCheckpoint {
    fn is_fully_acknowledged(&self) -> bool {
        self.received_acks == self.expected_acks
    }
}

struct CoordinatorState {
    pending: BTreeMap<CheckpointId, PendingCheckpoint>,
    completed: CompletedCheckpointStore,
    last_completion: Option<Instant>,
}

/// Per-job coordinator. The job master owns it and calls in from its timer
/// loop and its acknowledge/decline RPC handlers.
pub struct CheckpointCoordinator {
    job_id: JobId,
    settings: CheckpointSettings,
    counter: Arc<dyn CheckpointIdCounter>,
    storage: Arc<dyn CheckpointStorage>,
    state: Mutex<CoordinatorState>,
}

impl CheckpointCoordinator {
    pub fn new(
        job_id: JobId,
        settings: CheckpointSettings,
        counter: Arc<dyn CheckpointIdCounter>,
        storage: Arc<dyn CheckpointStorage>,
    ) -> Self {
        let max_retained = settings.max_retained;
        Self {
            job_id,
            settings,
            counter,
            storage,
            state: Mutex::new(CoordinatorState {
                pending: BTreeMap::new(),
                completed: CompletedCheckpointStore::new(max_retained),
                last_completion: None,
            }),
        }
    }

    /// Begin a checkpoint over `expected_acks`. Returns the barrier to
    /// inject at the source tasks.
    pub async fn trigger_checkpoint(
        &self,
        expected_acks: HashSet<ExecutionAttemptId>,
    ) -> Result<CheckpointBarrier> {
        if expected_acks.is_empty() {
            return Err(RuntimeError::Checkpoint(
                rivulet_checkpoint::CheckpointError::Storage(
                    "no running tasks to checkpoint".into(),
                ),
            ));
        }

        {
            let state = self.state.lock();
            if state.pending.len() >= self.settings.max_concurrent {
                debug!(job = %self.job_id, "declining trigger: too many concurrent checkpoints");
                return Err(RuntimeError::Checkpoint(
                    rivulet_checkpoint::CheckpointError::Aborted {
                        id: CheckpointId(0),
                        reason: DeclineReason::TooManyCheckpoints.to_string(),
                    },
                ));
            }
            if let Some(last) = state.last_completion {
                if last.elapsed() < self.settings.min_pause() {
                    return Err(RuntimeError::Checkpoint(
                        rivulet_checkpoint::CheckpointError::Storage(
                            "minimum pause between checkpoints not elapsed".into(),
                        ),
                    ));
                }
            }
        }

        let id = CheckpointId(self.counter.get_and_increment(self.job_id).await?);
        let timestamp = chrono::Utc::now().timestamp_millis();
        let options = if self.settings.unaligned {
            CheckpointOptions::unaligned()
        } else {
            CheckpointOptions::aligned()
        };

        let mut state = self.state.lock();
        state.pending.insert(
            id,
            PendingCheckpoint {
                checkpoint_id: id,
                trigger_timestamp: timestamp,
                deadline: Instant::now() + self.settings.timeout(),
                expected_acks,
                received_acks: HashSet::new(),
                operator_states: HashMap::new(),
            },
        );
        info!(job = %self.job_id, checkpoint = %id, "checkpoint triggered");
        Ok(CheckpointBarrier::new(id, timestamp, options))
    }

    /// Record one task's acknowledgement. Returns the completed checkpoint
    /// when this was the last expected ack, so the caller can broadcast
    /// `notify_complete`.
    pub async fn receive_acknowledge(
        &self,
        attempt: ExecutionAttemptId,
        subtask_index: u32,
        checkpoint_id: CheckpointId,
        _metrics: CheckpointMetrics,
        snapshot: TaskStateSnapshot,
    ) -> Result<Option<CompletedCheckpoint>> {
        let completed = {
            let mut state = self.state.lock();
            let Some(pending) = state.pending.get_mut(&checkpoint_id) else {
                debug!(checkpoint = %checkpoint_id, "ack for unknown checkpoint, ignoring");
                return Ok(None);
            };
            if !pending.expected_acks.contains(&attempt) {
                return Ok(None);
            }
            if !pending.received_acks.insert(attempt) {
                // Duplicate ack.
                return Ok(None);
            }
            for (operator_id, subtask_state) in snapshot.subtask_states {
                pending
                    .operator_states
                    .entry(operator_id)
                    .or_default()
                    .put(subtask_index, subtask_state);
            }
            if !pending.is_fully_acknowledged() {
                return Ok(None);
            }

            let pending = state
                .pending
                .remove(&checkpoint_id)
                .expect("checked present");
            let completed = CompletedCheckpoint {
                checkpoint_id,
                timestamp: pending.trigger_timestamp,
                duration_ms: (chrono::Utc::now().timestamp_millis()
                    - pending.trigger_timestamp)
                    .max(0) as u64,
                operator_states: pending.operator_states,
            };

            // A completed checkpoint subsumes everything older still
            // pending.
            let stale: Vec<CheckpointId> = state
                .pending
                .range(..checkpoint_id)
                .map(|(id, _)| *id)
                .collect();
            for id in stale {
                state.pending.remove(&id);
                debug!(checkpoint = %id, "subsumed by completed checkpoint {checkpoint_id}");
            }
            completed
        };

        self.storage.store_completed(&completed).await?;
        let evicted = {
            let mut state = self.state.lock();
            state.last_completion = Some(Instant::now());
            state.completed.add(completed.clone())
        };
        for old in evicted {
            let _ = self.storage.discard(old.checkpoint_id).await;
        }
        info!(job = %self.job_id, checkpoint = %completed.checkpoint_id, "checkpoint completed");
        Ok(Some(completed))
    }

    /// A task declined. Returns true when a pending checkpoint was aborted,
    /// so the caller broadcasts `notify_abort`.
    pub fn receive_decline(
        &self,
        attempt: ExecutionAttemptId,
        checkpoint_id: CheckpointId,
        reason: DeclineReason,
    ) -> bool {
        let mut state = self.state.lock();
        if state.pending.remove(&checkpoint_id).is_some() {
            warn!(
                job = %self.job_id,
                checkpoint = %checkpoint_id,
                %reason,
                from = %attempt,
                "checkpoint declined"
            );
            true
        } else {
            false
        }
    }

    /// Abort pending checkpoints past their deadline. Returns their ids for
    /// the abort broadcast.
    pub fn check_expired(&self) -> Vec<CheckpointId> {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<CheckpointId> = state
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            state.pending.remove(id);
            warn!(job = %self.job_id, checkpoint = %id, "checkpoint expired");
        }
        expired
    }

    /// Drop a pending checkpoint without a decline, e.g. on job shutdown.
    pub fn abort_pending(&self, checkpoint_id: CheckpointId) -> bool {
        self.state.lock().pending.remove(&checkpoint_id).is_some()
    }

    pub fn pending_ids(&self) -> Vec<CheckpointId> {
        self.state.lock().pending.keys().copied().collect()
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn latest_completed(&self) -> Option<CompletedCheckpoint> {
        self.state.lock().completed.latest().cloned()
    }

    /// Restore point for a global failover: the latest completed checkpoint
    /// held locally, falling back to storage.
    pub async fn restore_latest(&self) -> Result<Option<CompletedCheckpoint>> {
        if let Some(local) = self.latest_completed() {
            return Ok(Some(local));
        }
        Ok(self.storage.load_latest().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rivulet_checkpoint::{InMemoryCheckpointStorage, OperatorId, OperatorSubtaskState};
    use rivulet_core::ha::EmbeddedCheckpointIdCounter;

    fn coordinator(max_concurrent: usize) -> CheckpointCoordinator {
        let settings = CheckpointSettings {
            interval_ms: 10,
            timeout_ms: 1_000,
            max_concurrent,
            min_pause_ms: 0,
            max_retained: 2,
            unaligned: true,
        };
        CheckpointCoordinator::new(
            JobId::new(),
            settings,
            Arc::new(EmbeddedCheckpointIdCounter::default()),
            Arc::new(InMemoryCheckpointStorage::new()),
        )
    }

    fn snapshot_with_state() -> TaskStateSnapshot {
        let mut snapshot = TaskStateSnapshot::new();
        snapshot.put_subtask_state(OperatorId::new(), OperatorSubtaskState::default());
        snapshot
    }

    #[tokio::test]
    async fn test_full_acks_complete_checkpoint() {
        let coordinator = coordinator(1);
        let a = ExecutionAttemptId::new();
        let b = ExecutionAttemptId::new();

        let barrier = coordinator
            .trigger_checkpoint([a, b].into_iter().collect())
            .await
            .unwrap();
        assert_eq!(barrier.id, CheckpointId(1));
        assert_eq!(coordinator.num_pending(), 1);

        let none = coordinator
            .receive_acknowledge(a, 0, barrier.id, CheckpointMetrics::default(), snapshot_with_state())
            .await
            .unwrap();
        assert!(none.is_none());

        let completed = coordinator
            .receive_acknowledge(b, 0, barrier.id, CheckpointMetrics::default(), snapshot_with_state())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(completed.checkpoint_id, barrier.id);
        assert_eq!(coordinator.num_pending(), 0);
        assert_eq!(
            coordinator.latest_completed().unwrap().checkpoint_id,
            barrier.id
        );
    }

    #[tokio::test]
    async fn test_concurrent_limit_declines_trigger() {
        let coordinator = coordinator(1);
        let a = ExecutionAttemptId::new();

        coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await
            .unwrap();
        let second = coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_decline_purges_pending() {
        let coordinator = coordinator(1);
        let a = ExecutionAttemptId::new();

        let barrier = coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await
            .unwrap();
        assert!(coordinator.receive_decline(a, barrier.id, DeclineReason::Subsumed));
        assert_eq!(coordinator.num_pending(), 0);
        // Second decline is a no-op.
        assert!(!coordinator.receive_decline(a, barrier.id, DeclineReason::Subsumed));
    }

    #[tokio::test]
    async fn test_completed_checkpoint_subsumes_older_pending() {
        let coordinator = coordinator(2);
        let a = ExecutionAttemptId::new();

        let first = coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await
            .unwrap();
        let second = coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await
            .unwrap();
        assert!(second.id > first.id);

        let completed = coordinator
            .receive_acknowledge(a, 0, second.id, CheckpointMetrics::default(), snapshot_with_state())
            .await
            .unwrap();
        assert!(completed.is_some());
        // Checkpoint 1 is gone without ever completing.
        assert!(coordinator.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn test_ack_from_unexpected_attempt_is_ignored() {
        let coordinator = coordinator(1);
        let expected = ExecutionAttemptId::new();
        let stranger = ExecutionAttemptId::new();

        let barrier = coordinator
            .trigger_checkpoint([expected].into_iter().collect())
            .await
            .unwrap();
        let result = coordinator
            .receive_acknowledge(
                stranger,
                0,
                barrier.id,
                CheckpointMetrics::default(),
                snapshot_with_state(),
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(coordinator.num_pending(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_checkpoints_are_purged() {
        let coordinator = coordinator(1);
        let a = ExecutionAttemptId::new();

        let barrier = coordinator
            .trigger_checkpoint([a].into_iter().collect())
            .await
            .unwrap();
        tokio::time::advance(std::time::Duration::from_millis(1_500)).await;

        let expired = coordinator.check_expired();
        assert_eq!(expired, vec![barrier.id]);
        assert_eq!(coordinator.num_pending(), 0);
    }

    #[tokio::test]
    async fn test_checkpoint_ids_are_monotonic() {
        let coordinator = coordinator(5);
        let a = ExecutionAttemptId::new();
        let mut last = 0;
        for _ in 0..3 {
            let barrier = coordinator
                .trigger_checkpoint([a].into_iter().collect())
                .await
                .unwrap();
            assert!(barrier.id.0 > last);
            last = barrier.id.0;
        }
    }
}
