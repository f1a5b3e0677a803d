//! The data path between tasks.
//!
//! Producers write into result partitions split into single-consumer
//! subpartitions; consumers read through input gates whose channels are
//! either local (same process, direct view on the subpartition) or remote
//! (frame stream governed by credit-based flow control). Buffer memory is
//! bounded by a per-worker [`NetworkBufferPool`]; producers park on it when
//! the budget is exhausted. Checkpoint barriers travel in band as
//! priority-capable event frames and can never overtake records within a
//! channel.

pub mod buffer;
pub mod credit;
pub mod error;
pub mod events;
pub mod gate;
pub mod partition;
pub mod pool;
pub mod subpartition;

pub use buffer::{Buffer, BufferBuilder, BufferConsumer};
pub use credit::{
    bridge_remote, remote_channel, ChannelCredit, RemoteChannelReceiver, RemoteChannelSender,
};
pub use error::{NetworkError, Result};
pub use events::StreamFrame;
pub use gate::{FrameListener, InputChannel, InputGate, NoOpFrameListener};
pub use partition::{PartitionMode, ResultPartition, ResultPartitionManager};
pub use pool::NetworkBufferPool;
pub use subpartition::{
    AvailabilityListener, BufferAndBacklog, PipelinedSubpartition, SubpartitionView,
};
