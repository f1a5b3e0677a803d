//! Pipelined subpartitions: the single-consumer queues behind a result
//! partition.
//!
//! The queue holds lazily produced buffer consumers and event frames. A
//! priority add (an unaligned barrier) jumps ahead of queued data but never
//! ahead of earlier priority entries, and snapshots the finished data
//! buffers it overtook so the checkpoint can persist them as in-flight
//! state. The lock guards enqueue/dequeue bookkeeping only and is never held
//! across I/O.

use crate::buffer::{Buffer, BufferConsumer};
use crate::error::{NetworkError, Result};
use crate::events::StreamFrame;
use parking_lot::Mutex;
use rivulet_checkpoint::ids::ResultSubpartitionInfo;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::trace;

/// Consumer-side callbacks a view registers at creation.
pub trait AvailabilityListener: Send + Sync {
    fn notify_data_available(&self);

    fn notify_priority_event(&self) {
        self.notify_data_available();
    }
}

/// What a view's `poll_next` hands back.
#[derive(Debug)]
pub struct BufferAndBacklog {
    pub frame: StreamFrame,
    pub is_more_available: bool,
    /// Finished data buffers still queued; drives the consumer's credit
    /// requests. Events do not count.
    pub backlog: usize,
    pub is_event_available: bool,
}

struct QueueEntry {
    kind: EntryKind,
    priority: bool,
}

enum EntryKind {
    Data(BufferConsumer),
    Event(StreamFrame),
}

impl QueueEntry {
    fn is_finished_data(&self) -> bool {
        matches!(&self.kind, EntryKind::Data(c) if c.is_finished())
    }

    fn is_event(&self) -> bool {
        matches!(self.kind, EntryKind::Event(_))
    }
}

struct Inner {
    queue: VecDeque<QueueEntry>,
    flush_requested: bool,
    finished: bool,
    released: bool,
    view_created: bool,
    listener: Option<Arc<dyn AvailabilityListener>>,
    inflight_snapshot: Vec<Buffer>,
}

impl Inner {
    fn backlog(&self) -> usize {
        self.queue.iter().filter(|e| e.is_finished_data()).count()
    }

    fn head_pollable(&self) -> bool {
        match self.queue.front() {
            None => false,
            Some(entry) if entry.is_event() => true,
            Some(entry) if entry.is_finished_data() => true,
            Some(QueueEntry {
                kind: EntryKind::Data(c),
                ..
            }) => self.flush_requested && c.readable_bytes() > 0,
            Some(_) => false,
        }
    }

    fn event_available(&self) -> bool {
        self.queue.iter().any(|e| e.is_event())
    }
}

/// One target channel of a result partition, consumed exactly once.
pub struct PipelinedSubpartition {
    info: ResultSubpartitionInfo,
    inner: Mutex<Inner>,
}

impl PipelinedSubpartition {
    pub fn new(info: ResultSubpartitionInfo) -> Self {
        Self {
            info,
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                flush_requested: false,
                finished: false,
                released: false,
                view_created: false,
                listener: None,
                inflight_snapshot: Vec::new(),
            }),
        }
    }

    pub fn info(&self) -> ResultSubpartitionInfo {
        self.info
    }

    /// Append a data buffer consumer, or insert it at the priority head.
    /// Returns false once the subpartition is finished or released.
    pub fn add_buffer_consumer(&self, consumer: BufferConsumer, is_priority: bool) -> bool {
        self.add_entry(
            QueueEntry {
                kind: EntryKind::Data(consumer),
                priority: is_priority,
            },
            is_priority,
        )
    }

    /// Enqueue an event frame. Unaligned barriers are priority entries and
    /// trigger the in-flight snapshot; every other event appends.
    pub fn add_frame(&self, frame: StreamFrame) -> bool {
        let priority = frame.is_priority();
        self.add_entry(
            QueueEntry {
                kind: EntryKind::Event(frame),
                priority,
            },
            priority,
        )
    }

    fn add_entry(&self, entry: QueueEntry, is_priority: bool) -> bool {
        let listener;
        let notify_priority;
        {
            let mut inner = self.inner.lock();
            if inner.finished || inner.released {
                return false;
            }

            if is_priority {
                // The barrier overtakes the queued finished data buffers;
                // remember them for the unaligned checkpoint.
                inner.inflight_snapshot = inner
                    .queue
                    .iter()
                    .filter(|e| e.is_finished_data())
                    .map(|e| match &e.kind {
                        EntryKind::Data(c) => c.build(),
                        EntryKind::Event(_) => unreachable!("filtered to data entries"),
                    })
                    .collect();

                let insert_at = inner.queue.iter().take_while(|e| e.priority).count();
                inner.queue.insert(insert_at, entry);
            } else {
                inner.queue.push_back(entry);
            }

            notify_priority = is_priority;
            listener = if inner.head_pollable() || notify_priority {
                inner.listener.clone()
            } else {
                None
            };
        }

        if let Some(listener) = listener {
            if notify_priority {
                listener.notify_priority_event();
            } else {
                listener.notify_data_available();
            }
        }
        true
    }

    /// Buffers the last priority add overtook. Drained by the channel state
    /// writer when it persists output-side in-flight data.
    pub fn take_inflight_snapshot(&self) -> Vec<Buffer> {
        std::mem::take(&mut self.inner.lock().inflight_snapshot)
    }

    /// Mark the subpartition finished and append end-of-partition.
    pub fn finish(&self) {
        let listener;
        {
            let mut inner = self.inner.lock();
            if inner.finished || inner.released {
                return;
            }
            inner.queue.push_back(QueueEntry {
                kind: EntryKind::Event(StreamFrame::EndOfPartition),
                priority: false,
            });
            inner.finished = true;
            listener = inner.listener.clone();
        }
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// Notify the consumer if flushing changes what is pollable.
    pub fn flush(&self) {
        let listener;
        {
            let mut inner = self.inner.lock();
            let worth_notifying = inner.queue.len() > 1
                || matches!(
                    inner.queue.front(),
                    Some(QueueEntry { kind: EntryKind::Data(c), .. }) if c.readable_bytes() > 0
                );
            if !worth_notifying {
                return;
            }
            inner.flush_requested = true;
            listener = inner.listener.clone();
        }
        if let Some(listener) = listener {
            listener.notify_data_available();
        }
    }

    /// At most one view per pipelined subpartition.
    pub fn create_read_view(
        self: &Arc<Self>,
        listener: Arc<dyn AvailabilityListener>,
    ) -> Result<SubpartitionView> {
        let mut inner = self.inner.lock();
        if inner.released {
            return Err(NetworkError::SubpartitionReleased(self.info));
        }
        if inner.view_created {
            return Err(NetworkError::ViewAlreadyCreated(self.info));
        }
        inner.view_created = true;
        inner.listener = Some(listener);
        trace!(subpartition = ?self.info, "read view created");
        Ok(SubpartitionView {
            parent: Arc::clone(self),
        })
    }

    /// Close all queued consumers and prevent further adds.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.released = true;
        inner.queue.clear();
        inner.listener = None;
        inner.inflight_snapshot.clear();
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    fn poll_next(&self) -> Option<BufferAndBacklog> {
        let mut inner = self.inner.lock();
        if inner.released || !inner.head_pollable() {
            return None;
        }
        let entry = inner.queue.pop_front()?;
        let frame = match entry.kind {
            EntryKind::Data(consumer) => StreamFrame::Buffer(consumer.build()),
            EntryKind::Event(frame) => frame,
        };
        if inner.queue.is_empty() {
            inner.flush_requested = false;
        }
        Some(BufferAndBacklog {
            frame,
            is_more_available: inner.head_pollable(),
            backlog: inner.backlog(),
            is_event_available: inner.event_available(),
        })
    }
}

/// Handle a consumer polls a subpartition through.
pub struct SubpartitionView {
    parent: Arc<PipelinedSubpartition>,
}

impl SubpartitionView {
    pub fn poll_next(&self) -> Option<BufferAndBacklog> {
        self.parent.poll_next()
    }

    pub fn is_released(&self) -> bool {
        self.parent.is_released()
    }

    pub fn info(&self) -> ResultSubpartitionInfo {
        self.parent.info()
    }

    pub fn release(&self) {
        self.parent.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferBuilder;
    use bytes::Bytes;
    use rivulet_checkpoint::{CheckpointBarrier, CheckpointId, CheckpointOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        data: AtomicUsize,
        priority: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                data: AtomicUsize::new(0),
                priority: AtomicUsize::new(0),
            })
        }
    }

    impl AvailabilityListener for CountingListener {
        fn notify_data_available(&self) {
            self.data.fetch_add(1, Ordering::SeqCst);
        }

        fn notify_priority_event(&self) {
            self.priority.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn subpartition() -> Arc<PipelinedSubpartition> {
        Arc::new(PipelinedSubpartition::new(ResultSubpartitionInfo::new(0, 0)))
    }

    fn finished_data(bytes: &'static [u8]) -> BufferConsumer {
        BufferConsumer::finished(Bytes::from_static(bytes))
    }

    fn unaligned_barrier(id: u64) -> StreamFrame {
        StreamFrame::from_barrier(CheckpointBarrier::new(
            CheckpointId(id),
            0,
            CheckpointOptions::unaligned(),
        ))
    }

    #[test]
    fn test_fifo_for_data_buffers() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        assert!(sub.add_buffer_consumer(finished_data(b"a"), false));
        assert!(sub.add_buffer_consumer(finished_data(b"b"), false));

        let first = view.poll_next().unwrap();
        assert!(matches!(&first.frame, StreamFrame::Buffer(b) if b.data.as_ref() == b"a"));
        assert_eq!(first.backlog, 1);
        let second = view.poll_next().unwrap();
        assert!(matches!(&second.frame, StreamFrame::Buffer(b) if b.data.as_ref() == b"b"));
        assert_eq!(second.backlog, 0);
        assert!(view.poll_next().is_none());
    }

    #[test]
    fn test_priority_barrier_jumps_queue_and_snapshots() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        sub.add_buffer_consumer(finished_data(b"r1"), false);
        sub.add_buffer_consumer(finished_data(b"r2"), false);
        assert!(sub.add_frame(unaligned_barrier(5)));

        // Barrier first, then the data it overtook.
        let head = view.poll_next().unwrap();
        assert!(head.frame.barrier().is_some());

        let snapshot = sub.take_inflight_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].data.as_ref(), b"r1");
        assert_eq!(snapshot[1].data.as_ref(), b"r2");

        // Snapshot is drained once.
        assert!(sub.take_inflight_snapshot().is_empty());

        let r1 = view.poll_next().unwrap();
        assert!(matches!(&r1.frame, StreamFrame::Buffer(b) if b.data.as_ref() == b"r1"));
    }

    #[test]
    fn test_priority_does_not_overtake_priority() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        sub.add_frame(unaligned_barrier(1));
        sub.add_frame(unaligned_barrier(2));

        assert_eq!(
            view.poll_next().unwrap().frame.barrier().unwrap().id,
            CheckpointId(1)
        );
        assert_eq!(
            view.poll_next().unwrap().frame.barrier().unwrap().id,
            CheckpointId(2)
        );
    }

    #[test]
    fn test_unfinished_head_needs_flush() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        let (builder, consumer) = BufferBuilder::new();
        sub.add_buffer_consumer(consumer, false);
        builder.append(b"partial");

        assert!(view.poll_next().is_none());

        sub.flush();
        let polled = view.poll_next().unwrap();
        assert!(matches!(&polled.frame, StreamFrame::Buffer(b) if b.data.as_ref() == b"partial"));
    }

    #[test]
    fn test_flush_on_empty_queue_is_a_no_op() {
        let sub = subpartition();
        let listener = CountingListener::new();
        let _view = sub.create_read_view(listener.clone()).unwrap();

        sub.flush();
        assert_eq!(listener.data.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finish_appends_end_of_partition_and_blocks_adds() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        sub.finish();
        assert!(!sub.add_buffer_consumer(finished_data(b"late"), false));
        assert!(!sub.add_frame(unaligned_barrier(9)));

        let polled = view.poll_next().unwrap();
        assert!(matches!(polled.frame, StreamFrame::EndOfPartition));
    }

    #[test]
    fn test_single_view_enforced() {
        let sub = subpartition();
        let _view = sub.create_read_view(CountingListener::new()).unwrap();
        assert!(matches!(
            sub.create_read_view(CountingListener::new()),
            Err(NetworkError::ViewAlreadyCreated(_))
        ));
    }

    #[test]
    fn test_release_stops_everything() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();
        sub.add_buffer_consumer(finished_data(b"x"), false);

        sub.release();
        assert!(view.poll_next().is_none());
        assert!(!sub.add_buffer_consumer(finished_data(b"y"), false));
        assert!(sub.is_released());
    }

    #[test]
    fn test_priority_notification_reaches_listener() {
        let sub = subpartition();
        let listener = CountingListener::new();
        let _view = sub.create_read_view(listener.clone()).unwrap();

        sub.add_frame(unaligned_barrier(1));
        assert_eq!(listener.priority.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backlog_ignores_events() {
        let sub = subpartition();
        let view = sub.create_read_view(CountingListener::new()).unwrap();

        sub.add_buffer_consumer(finished_data(b"d"), false);
        sub.add_frame(StreamFrame::EndOfSuperstep);

        let polled = view.poll_next().unwrap();
        assert_eq!(polled.backlog, 0);
        assert!(polled.is_event_available);
    }
}
