//! Network buffers and the builder/consumer pair producers write through.

use crate::pool::PoolPermit;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::Arc;

/// An immutable chunk of stream data.
///
/// `is_event` marks serialized control frames; events never count toward the
/// consumer-visible backlog and never consume credit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Buffer {
    pub data: Bytes,
    pub is_event: bool,
}

impl Buffer {
    pub fn data_buffer(data: Bytes) -> Self {
        Self {
            data,
            is_event: false,
        }
    }

    pub fn event(data: Bytes) -> Self {
        Self {
            data,
            is_event: true,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_buffer(&self) -> bool {
        !self.is_event
    }
}

struct BuilderInner {
    data: BytesMut,
    finished: bool,
    /// Segment size when the buffer came out of a pool.
    capacity: Option<usize>,
}

/// Producer-side handle appending bytes into one buffer.
pub struct BufferBuilder {
    inner: Arc<Mutex<BuilderInner>>,
}

impl BufferBuilder {
    pub fn new() -> (BufferBuilder, BufferConsumer) {
        Self::pair(None, None)
    }

    /// A builder backed by one segment of a buffer pool; the permit rides on
    /// the consumer and recycles when the consumer is dropped.
    pub(crate) fn new_pooled(
        capacity: usize,
        permit: PoolPermit,
    ) -> (BufferBuilder, BufferConsumer) {
        Self::pair(Some(capacity), Some(permit))
    }

    fn pair(capacity: Option<usize>, permit: Option<PoolPermit>) -> (BufferBuilder, BufferConsumer) {
        let inner = Arc::new(Mutex::new(BuilderInner {
            data: BytesMut::new(),
            finished: false,
            capacity,
        }));
        (
            BufferBuilder {
                inner: Arc::clone(&inner),
            },
            BufferConsumer {
                inner,
                _permit: permit,
            },
        )
    }

    pub fn append(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock();
        debug_assert!(!inner.finished, "append after finish");
        if let Some(capacity) = inner.capacity {
            debug_assert!(
                inner.data.len() + bytes.len() <= capacity,
                "write exceeds the pool segment size"
            );
        }
        inner.data.extend_from_slice(bytes);
    }

    /// Seal the buffer; the paired consumer becomes finished.
    pub fn finish(&self) {
        self.inner.lock().finished = true;
    }
}

/// Consumer-side handle over a buffer that may still be written.
pub struct BufferConsumer {
    inner: Arc<Mutex<BuilderInner>>,
    /// Pool budget held until this consumer is dropped after consumption.
    _permit: Option<PoolPermit>,
}

impl BufferConsumer {
    /// A consumer over an already complete buffer, outside any pool budget.
    pub fn finished(data: Bytes) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BuilderInner {
                data: BytesMut::from(data.as_ref()),
                finished: true,
                capacity: None,
            })),
            _permit: None,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    pub fn readable_bytes(&self) -> usize {
        self.inner.lock().data.len()
    }

    /// Snapshot the currently written bytes into an immutable buffer.
    pub fn build(&self) -> Buffer {
        let inner = self.inner.lock();
        Buffer::data_buffer(Bytes::copy_from_slice(&inner.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_consumer_pair() {
        let (builder, consumer) = BufferBuilder::new();
        assert!(!consumer.is_finished());

        builder.append(b"hello ");
        builder.append(b"world");
        assert_eq!(consumer.readable_bytes(), 11);

        builder.finish();
        assert!(consumer.is_finished());
        assert_eq!(consumer.build().data.as_ref(), b"hello world");
    }

    #[test]
    fn test_pre_finished_consumer() {
        let consumer = BufferConsumer::finished(Bytes::from_static(b"xy"));
        assert!(consumer.is_finished());
        assert_eq!(consumer.build().len(), 2);
    }

    #[test]
    fn test_event_buffers_are_not_data() {
        let event = Buffer::event(Bytes::from_static(b"barrier"));
        assert!(event.is_event);
        assert!(!event.is_buffer());
    }
}
