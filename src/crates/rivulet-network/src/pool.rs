//! The network buffer pool: a fixed budget of equal-size buffers.
//!
//! Producers request a buffer before writing; when none are free the
//! request parks until a consumed buffer is recycled, which is how memory
//! backpressure propagates upstream ahead of credit. Recycling is automatic:
//! the permit rides on the [`BufferConsumer`] and returns to the pool when
//! the consumer is dropped after consumption.

use crate::buffer::{BufferBuilder, BufferConsumer};
use crate::error::{NetworkError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Returns one buffer's worth of budget to the pool on drop.
pub(crate) struct PoolPermit {
    permits: Arc<Semaphore>,
}

impl Drop for PoolPermit {
    fn drop(&mut self) {
        self.permits.add_permits(1);
    }
}

/// Fixed-budget source of network buffers, one pool per worker.
pub struct NetworkBufferPool {
    segment_size: usize,
    total_buffers: usize,
    permits: Arc<Semaphore>,
}

impl NetworkBufferPool {
    pub fn new(total_buffers: usize, segment_size: usize) -> Self {
        let total_buffers = total_buffers.max(1);
        Self {
            segment_size,
            total_buffers,
            permits: Arc::new(Semaphore::new(total_buffers)),
        }
    }

    /// Size the pool from a worker's network memory budget, falling back to
    /// `fallback_buffers` when no budget was declared.
    pub fn from_budget(
        network_memory_bytes: u64,
        segment_size: usize,
        fallback_buffers: usize,
    ) -> Self {
        let from_memory = (network_memory_bytes as usize) / segment_size.max(1);
        let total = if from_memory > 0 {
            from_memory
        } else {
            fallback_buffers
        };
        Self::new(total, segment_size)
    }

    /// Obtain a buffer, waiting while the budget is exhausted.
    pub async fn request_buffer(&self) -> Result<(BufferBuilder, BufferConsumer)> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| NetworkError::PoolExhausted)?;
        permit.forget();
        Ok(self.build_pair())
    }

    /// Obtain a buffer without waiting; fails when the budget is exhausted.
    pub fn try_request_buffer(&self) -> Result<(BufferBuilder, BufferConsumer)> {
        match self.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(self.build_pair())
            }
            Err(_) => Err(NetworkError::PoolExhausted),
        }
    }

    fn build_pair(&self) -> (BufferBuilder, BufferConsumer) {
        BufferBuilder::new_pooled(
            self.segment_size,
            PoolPermit {
                permits: Arc::clone(&self.permits),
            },
        )
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn total_buffers(&self) -> usize {
        self.total_buffers
    }

    pub fn available_buffers(&self) -> usize {
        self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_budget_is_enforced_and_recycled() {
        let pool = NetworkBufferPool::new(2, 1024);
        assert_eq!(pool.available_buffers(), 2);

        let first = pool.request_buffer().await.unwrap();
        let second = pool.request_buffer().await.unwrap();
        assert_eq!(pool.available_buffers(), 0);

        assert!(matches!(
            pool.try_request_buffer(),
            Err(NetworkError::PoolExhausted)
        ));

        // Dropping the consumer recycles its budget.
        drop(first);
        assert_eq!(pool.available_buffers(), 1);
        pool.try_request_buffer().unwrap();
        drop(second);
    }

    #[tokio::test]
    async fn test_request_waits_for_recycling() {
        let pool = Arc::new(NetworkBufferPool::new(1, 1024));
        let held = pool.request_buffer().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(20), pool.request_buffer());
        assert!(blocked.await.is_err());

        drop(held);
        tokio::time::timeout(Duration::from_millis(100), pool.request_buffer())
            .await
            .expect("budget was recycled")
            .unwrap();
    }

    #[tokio::test]
    async fn test_from_budget_sizing() {
        let sized = NetworkBufferPool::from_budget(64 * 1024, 32 * 1024, 8);
        assert_eq!(sized.total_buffers(), 2);

        let fallback = NetworkBufferPool::from_budget(0, 32 * 1024, 8);
        assert_eq!(fallback.total_buffers(), 8);
    }

    #[tokio::test]
    async fn test_pooled_buffer_flows_like_any_other() {
        let pool = NetworkBufferPool::new(1, 1024);
        let (builder, consumer) = pool.request_buffer().await.unwrap();
        builder.append(b"record");
        builder.finish();
        assert!(consumer.is_finished());
        assert_eq!(consumer.build().data.as_ref(), b"record");
    }
}
