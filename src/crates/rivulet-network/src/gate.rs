//! Input gates: the consumer side of a network edge.
//!
//! A gate aggregates one input channel per upstream subtask. Each channel
//! has a pump task moving frames from its source (a local subpartition view
//! or a remote frame stream) into the channel queue; the pump is the
//! "network receive" plane and invokes the gate's [`FrameListener`] at
//! receipt time, before the task thread ever polls the frame. Per channel,
//! frames are consumed in the order produced.

use crate::credit::{ChannelCredit, RemoteChannelReceiver};
use crate::events::StreamFrame;
use crate::subpartition::{AvailabilityListener, PipelinedSubpartition, SubpartitionView};
use crate::Result;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::InputChannelInfo;
use rivulet_checkpoint::{CancelCheckpointMarker, CheckpointBarrier};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::trace;

/// Receipt-time callbacks, invoked from the pump tasks. The unaligned
/// barrier handler sits behind this.
pub trait FrameListener: Send + Sync {
    fn on_buffer_received(&self, channel: InputChannelInfo, buffer: &crate::buffer::Buffer);
    fn on_barrier_received(&self, channel: InputChannelInfo, barrier: &CheckpointBarrier);
    fn on_cancel_marker(&self, channel: InputChannelInfo, marker: &CancelCheckpointMarker);
    fn on_end_of_partition(&self, channel: InputChannelInfo);
}

/// Listener that ignores everything; used by tasks without checkpointing.
pub struct NoOpFrameListener;

impl FrameListener for NoOpFrameListener {
    fn on_buffer_received(&self, _channel: InputChannelInfo, _buffer: &crate::buffer::Buffer) {}
    fn on_barrier_received(&self, _channel: InputChannelInfo, _barrier: &CheckpointBarrier) {}
    fn on_cancel_marker(&self, _channel: InputChannelInfo, _marker: &CancelCheckpointMarker) {}
    fn on_end_of_partition(&self, _channel: InputChannelInfo) {}
}

struct NotifyAvailability {
    notify: Notify,
}

impl AvailabilityListener for NotifyAvailability {
    fn notify_data_available(&self) {
        self.notify.notify_one();
    }
}

enum ChannelSource {
    Local {
        view: SubpartitionView,
        availability: Arc<NotifyAvailability>,
    },
    Remote(RemoteChannelReceiver),
}

/// One input channel of a gate.
pub struct InputChannel {
    info: InputChannelInfo,
    queue: Mutex<VecDeque<StreamFrame>>,
    closed: AtomicBool,
    /// Taken by the pump when the gate starts.
    source: Mutex<Option<ChannelSource>>,
    /// Present for remote channels; replenished when the task consumes.
    credit: Option<Arc<ChannelCredit>>,
}

impl InputChannel {
    /// Channel over a subpartition produced in the same process.
    pub fn local(info: InputChannelInfo, subpartition: &Arc<PipelinedSubpartition>) -> Result<Self> {
        let availability = Arc::new(NotifyAvailability {
            notify: Notify::new(),
        });
        let view = subpartition.create_read_view(availability.clone())?;
        Ok(Self {
            info,
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            source: Mutex::new(Some(ChannelSource::Local { view, availability })),
            credit: None,
        })
    }

    /// Channel fed by a remote producer through credit-based transport.
    pub fn remote(info: InputChannelInfo, receiver: RemoteChannelReceiver) -> Self {
        let credit = Arc::clone(&receiver.credit);
        Self {
            info,
            queue: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
            source: Mutex::new(Some(ChannelSource::Remote(receiver))),
            credit: Some(credit),
        }
    }

    pub fn info(&self) -> InputChannelInfo {
        self.info
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn pop(&self) -> Option<StreamFrame> {
        self.queue.lock().pop_front()
    }

    fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// A task's aggregate consumer of one upstream partition.
pub struct InputGate {
    gate_index: u32,
    channels: Vec<Arc<InputChannel>>,
    available: Arc<Notify>,
    open_channels: Arc<AtomicUsize>,
    next_channel: AtomicUsize,
    pumps: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl InputGate {
    pub fn new(gate_index: u32, channels: Vec<InputChannel>) -> Self {
        let open = channels.len();
        Self {
            gate_index,
            channels: channels.into_iter().map(Arc::new).collect(),
            available: Arc::new(Notify::new()),
            open_channels: Arc::new(AtomicUsize::new(open)),
            next_channel: AtomicUsize::new(0),
            pumps: Mutex::new(Vec::new()),
        }
    }

    pub fn gate_index(&self) -> u32 {
        self.gate_index
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_open_channels(&self) -> usize {
        self.open_channels.load(Ordering::SeqCst)
    }

    pub fn channel_infos(&self) -> Vec<InputChannelInfo> {
        self.channels.iter().map(|c| c.info()).collect()
    }

    /// Spawn the pump tasks. `listener` sees every frame at receipt time.
    pub fn start(&self, listener: Arc<dyn FrameListener>) {
        let mut pumps = self.pumps.lock();
        for channel in &self.channels {
            let Some(source) = channel.source.lock().take() else {
                continue;
            };
            let pump = spawn_pump(
                Arc::clone(channel),
                source,
                Arc::clone(&listener),
                Arc::clone(&self.available),
                Arc::clone(&self.open_channels),
            );
            pumps.push(pump);
        }
    }

    /// Next frame in arrival order, fair across channels. Returns `None`
    /// once every channel is closed and drained.
    pub async fn poll_next(&self) -> Option<(InputChannelInfo, StreamFrame)> {
        loop {
            let n = self.channels.len();
            let start = self.next_channel.fetch_add(1, Ordering::Relaxed) % n.max(1);
            for i in 0..n {
                let channel = &self.channels[(start + i) % n];
                if let Some(frame) = channel.pop() {
                    if matches!(&frame, StreamFrame::Buffer(b) if b.is_buffer()) {
                        if let Some(credit) = &channel.credit {
                            credit.add_credit(1);
                        }
                    }
                    return Some((channel.info(), frame));
                }
            }

            let all_done = self.open_channels.load(Ordering::SeqCst) == 0
                && self.channels.iter().all(|c| c.queue_len() == 0);
            if all_done {
                return None;
            }
            self.available.notified().await;
        }
    }

    pub fn shutdown(&self) {
        for pump in self.pumps.lock().drain(..) {
            pump.abort();
        }
    }
}

impl Drop for InputGate {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_pump(
    channel: Arc<InputChannel>,
    source: ChannelSource,
    listener: Arc<dyn FrameListener>,
    available: Arc<Notify>,
    open_channels: Arc<AtomicUsize>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match source {
            ChannelSource::Local { view, availability } => loop {
                let mut saw_end = false;
                while let Some(polled) = view.poll_next() {
                    let end = receive_frame(&channel, polled.frame, &listener, &available);
                    if end {
                        saw_end = true;
                        break;
                    }
                }
                if saw_end {
                    break;
                }
                availability.notify.notified().await;
            },
            ChannelSource::Remote(mut receiver) => {
                loop {
                    match receiver.rx.recv().await {
                        Some(frame) => {
                            if receive_frame(&channel, frame, &listener, &available) {
                                break;
                            }
                        }
                        None => {
                            // Producer went away without end-of-partition.
                            receive_frame(
                                &channel,
                                StreamFrame::EndOfPartition,
                                &listener,
                                &available,
                            );
                            break;
                        }
                    }
                }
            }
        }
        open_channels.fetch_sub(1, Ordering::SeqCst);
        available.notify_one();
    })
}

/// Network-plane receipt of one frame. Returns true on end-of-partition.
fn receive_frame(
    channel: &Arc<InputChannel>,
    frame: StreamFrame,
    listener: &Arc<dyn FrameListener>,
    available: &Arc<Notify>,
) -> bool {
    let info = channel.info();
    let mut end = false;
    match &frame {
        StreamFrame::Buffer(buffer) if buffer.is_buffer() => {
            listener.on_buffer_received(info, buffer);
        }
        StreamFrame::Buffer(_) => {}
        StreamFrame::BarrierAligned(barrier) | StreamFrame::BarrierUnaligned(barrier) => {
            if channel.is_closed() {
                // A barrier on a closed channel is end-of-partition, not a
                // barrier.
                trace!(channel = %info, "dropping barrier on closed channel");
                return true;
            }
            listener.on_barrier_received(info, barrier);
        }
        StreamFrame::CancelCheckpointMarker(marker) => {
            listener.on_cancel_marker(info, marker);
        }
        StreamFrame::EndOfPartition => {
            channel.closed.store(true, Ordering::SeqCst);
            listener.on_end_of_partition(info);
            end = true;
        }
        StreamFrame::EndOfSuperstep => {}
    }
    channel.queue.lock().push_back(frame);
    available.notify_one();
    end
}
