//! Minimal operator surface hosted by a task.
//!
//! User-defined function APIs live outside the runtime; a task only needs
//! something that consumes records, emits records, and can snapshot and
//! restore its state as opaque handles.

use bytes::Bytes;
use rivulet_checkpoint::{
    CheckpointId, KeyedStateHandle, OperatorId, OperatorStateHandle, OperatorSubtaskState,
    TaskStateSnapshot,
};
use rivulet_core::Result;
use std::collections::HashMap;

/// One operator in a chain.
pub trait StreamOperator: Send + Sync {
    fn operator_id(&self) -> OperatorId;

    /// Process one record, appending any output records to `out`.
    fn process_record(&mut self, record: Bytes, out: &mut Vec<Bytes>) -> Result<()>;

    /// Snapshot non-keyed and keyed state for `checkpoint_id`.
    fn snapshot_state(
        &mut self,
        checkpoint_id: CheckpointId,
    ) -> Result<(Option<OperatorStateHandle>, Option<KeyedStateHandle>)>;

    /// Restore from a previously snapshotted state.
    fn restore_state(&mut self, state: &OperatorSubtaskState) -> Result<()>;

    fn notify_checkpoint_complete(&mut self, _checkpoint_id: CheckpointId) {}

    fn notify_checkpoint_abort(&mut self, _checkpoint_id: CheckpointId) {}
}

/// The operators a task runs, record flow piped head to tail.
pub struct OperatorChain {
    operators: Vec<Box<dyn StreamOperator>>,
}

impl OperatorChain {
    pub fn new(operators: Vec<Box<dyn StreamOperator>>) -> Self {
        Self { operators }
    }

    /// A chain that forwards records untouched.
    pub fn forwarding() -> Self {
        Self::new(vec![Box::new(ForwardingOperator::new())])
    }

    /// Build a chain from the opaque task configuration of a deployment
    /// descriptor. Only the built-in operators are constructible here; user
    /// operators arrive through their own factories outside the runtime.
    ///
    /// Expected shape: `{"operators": [{"kind": "forward" | "counter",
    /// "id": "<uuid>"}]}`. Anything else falls back to a forwarding chain.
    pub fn from_config(config: &serde_json::Value) -> Self {
        let Some(entries) = config.get("operators").and_then(|v| v.as_array()) else {
            return Self::forwarding();
        };
        let mut operators: Vec<Box<dyn StreamOperator>> = Vec::new();
        for entry in entries {
            let operator_id = entry
                .get("id")
                .and_then(|v| v.as_str())
                .and_then(|s| uuid::Uuid::parse_str(s).ok())
                .map(OperatorId::from_uuid)
                .unwrap_or_default();
            match entry.get("kind").and_then(|v| v.as_str()) {
                Some("counter") => {
                    operators.push(Box::new(RecordCounter::with_operator_id(operator_id)))
                }
                _ => operators.push(Box::new(ForwardingOperator::with_operator_id(operator_id))),
            }
        }
        if operators.is_empty() {
            return Self::forwarding();
        }
        Self::new(operators)
    }

    pub fn operator_ids(&self) -> Vec<OperatorId> {
        self.operators.iter().map(|op| op.operator_id()).collect()
    }

    /// Run one record through the whole chain, returning the tail's output.
    pub fn process_record(&mut self, record: Bytes) -> Result<Vec<Bytes>> {
        let mut current = vec![record];
        for operator in &mut self.operators {
            let mut next = Vec::new();
            for record in current {
                operator.process_record(record, &mut next)?;
            }
            current = next;
        }
        Ok(current)
    }

    /// Snapshot every operator. Channel state is attached by the caller.
    pub fn snapshot_all(
        &mut self,
        checkpoint_id: CheckpointId,
    ) -> Result<HashMap<OperatorId, OperatorSubtaskState>> {
        let mut states = HashMap::new();
        for operator in &mut self.operators {
            let (operator_state, keyed_state) = operator.snapshot_state(checkpoint_id)?;
            states.insert(
                operator.operator_id(),
                OperatorSubtaskState {
                    operator_state,
                    keyed_state,
                    input_channel_state: Vec::new(),
                    result_subpartition_state: Vec::new(),
                },
            );
        }
        Ok(states)
    }

    pub fn restore_all(&mut self, snapshot: &TaskStateSnapshot) -> Result<()> {
        for operator in &mut self.operators {
            if let Some(state) = snapshot.subtask_states.get(&operator.operator_id()) {
                operator.restore_state(state)?;
            }
        }
        Ok(())
    }

    pub fn notify_checkpoint_complete(&mut self, checkpoint_id: CheckpointId) {
        for operator in &mut self.operators {
            operator.notify_checkpoint_complete(checkpoint_id);
        }
    }

    pub fn notify_checkpoint_abort(&mut self, checkpoint_id: CheckpointId) {
        for operator in &mut self.operators {
            operator.notify_checkpoint_abort(checkpoint_id);
        }
    }
}

/// Stateless pass-through operator.
pub struct ForwardingOperator {
    operator_id: OperatorId,
}

impl ForwardingOperator {
    pub fn new() -> Self {
        Self {
            operator_id: OperatorId::new(),
        }
    }

    pub fn with_operator_id(operator_id: OperatorId) -> Self {
        Self { operator_id }
    }
}

impl Default for ForwardingOperator {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOperator for ForwardingOperator {
    fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    fn process_record(&mut self, record: Bytes, out: &mut Vec<Bytes>) -> Result<()> {
        out.push(record);
        Ok(())
    }

    fn snapshot_state(
        &mut self,
        _checkpoint_id: CheckpointId,
    ) -> Result<(Option<OperatorStateHandle>, Option<KeyedStateHandle>)> {
        Ok((None, None))
    }

    fn restore_state(&mut self, _state: &OperatorSubtaskState) -> Result<()> {
        Ok(())
    }
}

/// Counts records and carries the count through checkpoints. Used by tests
/// that exercise snapshot/restore.
pub struct RecordCounter {
    operator_id: OperatorId,
    count: u64,
}

impl RecordCounter {
    pub fn new() -> Self {
        Self {
            operator_id: OperatorId::new(),
            count: 0,
        }
    }

    pub fn with_operator_id(operator_id: OperatorId) -> Self {
        Self {
            operator_id,
            count: 0,
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl Default for RecordCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamOperator for RecordCounter {
    fn operator_id(&self) -> OperatorId {
        self.operator_id
    }

    fn process_record(&mut self, record: Bytes, out: &mut Vec<Bytes>) -> Result<()> {
        self.count += 1;
        out.push(record);
        Ok(())
    }

    fn snapshot_state(
        &mut self,
        _checkpoint_id: CheckpointId,
    ) -> Result<(Option<OperatorStateHandle>, Option<KeyedStateHandle>)> {
        let payload = Bytes::from(self.count.to_be_bytes().to_vec());
        Ok((
            Some(OperatorStateHandle {
                operator_id: self.operator_id,
                payload,
            }),
            None,
        ))
    }

    fn restore_state(&mut self, state: &OperatorSubtaskState) -> Result<()> {
        if let Some(handle) = &state.operator_state {
            let mut raw = [0u8; 8];
            if handle.payload.len() == 8 {
                raw.copy_from_slice(&handle.payload);
                self.count = u64::from_be_bytes(raw);
            }
        }
        Ok(())
    }
}
