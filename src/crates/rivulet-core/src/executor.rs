//! Component main executors.
//!
//! Every top-level component owns a [`MainThreadExecutor`]: a queue drained
//! by one task, so all state-mutating operations of that component run
//! sequentially. Cross-component calls enqueue onto the callee's executor
//! and complete back on the caller's. Blocking work never runs here; it goes
//! through [`run_blocking`] onto the process-wide I/O pool.

use crate::error::{Result, RuntimeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

/// Serializes all work of one component onto a single logical thread.
#[derive(Clone)]
pub struct MainThreadExecutor {
    name: Arc<String>,
    tx: mpsc::UnboundedSender<BoxFuture<'static, ()>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl MainThreadExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        let name = Arc::new(name.into());
        let (tx, mut rx) = mpsc::unbounded_channel::<BoxFuture<'static, ()>>();

        let loop_name = Arc::clone(&name);
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(component = %loop_name, "main executor drained and stopped");
        });

        Self {
            name,
            tx,
            closed: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a job. Jobs run in enqueue order, one at a time.
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RuntimeError::ShutDown(self.name.to_string()));
        }
        self.tx
            .send(job.boxed())
            .map_err(|_| RuntimeError::ShutDown(self.name.to_string()))
    }

    /// Run a closure on the executor and await its result.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(async move {
            let _ = tx.send(f());
        })?;
        rx.await
            .map_err(|_| RuntimeError::ShutDown(self.name.to_string()))
    }

    /// Run a future-producing closure on the executor and await its result.
    /// The produced future itself runs on the executor, keeping the
    /// component's suspension points serialized.
    pub async fn run_async<T, F, Fut>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.execute(async move {
            let _ = tx.send(f().await);
        })?;
        rx.await
            .map_err(|_| RuntimeError::ShutDown(self.name.to_string()))
    }

    /// Enqueue `job` after `delay`. The returned handle cancels the timer
    /// (not a job that already started running).
    pub fn schedule<F>(&self, delay: Duration, job: F) -> ScheduledTask
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let executor = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = executor.execute(job);
        });
        ScheduledTask { handle }
    }

    /// Refuse new jobs; already-enqueued jobs still run.
    pub fn stop(&self) {
        self.closed.store(true, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Handle to a timer created with [`MainThreadExecutor::schedule`].
#[derive(Debug)]
pub struct ScheduledTask {
    handle: tokio::task::JoinHandle<()>,
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Run blocking work on the process-wide I/O pool, off every main executor.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RuntimeError::Other(format!("blocking task panicked: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_jobs_run_in_order() {
        let executor = MainThreadExecutor::new("test");
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..10 {
            let log = Arc::clone(&log);
            executor
                .execute(async move {
                    log.lock().push(i);
                })
                .unwrap();
        }

        // A run() call queues behind everything above.
        executor.run(|| ()).await.unwrap();
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_run_returns_value() {
        let executor = MainThreadExecutor::new("test");
        let value = executor.run(|| 41 + 1).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduled_job_fires_after_delay() {
        let executor = MainThreadExecutor::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let _task = executor.schedule(Duration::from_millis(100), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(50)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(60)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stopped_executor_refuses_jobs() {
        let executor = MainThreadExecutor::new("test");
        executor.stop();
        assert!(executor.execute(async {}).is_err());
        assert!(executor.run(|| 1).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let executor = MainThreadExecutor::new("test");
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = Arc::clone(&fired);
        let task = executor.schedule(Duration::from_millis(100), async move {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        tokio::time::advance(Duration::from_millis(200)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
