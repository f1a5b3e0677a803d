//! The worker process: task executor, slot table, task runners and the
//! checkpoint barrier handler.
//!
//! A task executor publishes a fixed number of typed slots to the resource
//! manager, hosts task executions inside those slots, participates in
//! credit-based data exchange through `rivulet-network`, and snapshots
//! operator state under coordinator direction. The unaligned barrier
//! algorithm lives in [`barrier`].

pub mod barrier;
pub mod channel_state;
pub mod operator;
pub mod slot_table;
pub mod task;
pub mod task_executor;

pub use barrier::{AlignmentFuture, CheckpointBarrierHandler, CheckpointableTask};
pub use channel_state::ChannelStateWriter;
pub use operator::{ForwardingOperator, OperatorChain, RecordCounter, StreamOperator};
pub use slot_table::{TaskSlot, TaskSlotTable};
pub use task::{StreamTask, StreamTaskSpec, TaskHandle};
pub use task_executor::TaskExecutor;
