//! Graceful shutdown handling.
//!
//! One coordinator per process; components clone the handle and either wait
//! for the signal or request termination with a final status.

use crate::state::ApplicationStatus;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// Shutdown coordinator for graceful termination.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    shutdown_requested: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
    status: Arc<Mutex<Option<ApplicationStatus>>>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field(
                "shutdown_requested",
                &self.shutdown_requested.load(Ordering::SeqCst),
            )
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            shutdown_requested: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            status: Arc::new(Mutex::new(None)),
        }
    }

    /// Request shutdown with a final application status. The first request
    /// wins; later statuses are ignored.
    pub fn request_shutdown(&self, status: ApplicationStatus) {
        if !self.shutdown_requested.swap(true, Ordering::SeqCst) {
            *self.status.lock() = Some(status);
            info!(?status, "shutdown requested");
            self.shutdown_notify.notify_waiters();
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// The status the cluster is terminating with, once requested.
    pub fn status(&self) -> Option<ApplicationStatus> {
        *self.status.lock()
    }

    /// Wait until shutdown is requested and return the final status.
    pub async fn wait_for_shutdown(&self) -> ApplicationStatus {
        if !self.is_shutdown_requested() {
            self.shutdown_notify.notified().await;
        }
        self.status().unwrap_or(ApplicationStatus::Succeeded)
    }

    /// Install SIGINT/SIGTERM handlers that request a CANCELED shutdown.
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();

        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};

                let mut sigint = match signal(SignalKind::interrupt()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to install SIGINT handler: {e}");
                        return;
                    }
                };
                let mut sigterm = match signal(SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("failed to install SIGTERM handler: {e}");
                        return;
                    }
                };

                tokio::select! {
                    _ = sigint.recv() => {
                        warn!("received SIGINT, initiating graceful shutdown");
                    }
                    _ = sigterm.recv() => {
                        warn!("received SIGTERM, initiating graceful shutdown");
                    }
                }
                coordinator.request_shutdown(ApplicationStatus::Canceled);
            }

            #[cfg(not(unix))]
            {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("received Ctrl+C, initiating graceful shutdown");
                    coordinator.request_shutdown(ApplicationStatus::Canceled);
                }
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_status_wins() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown(ApplicationStatus::Failed);
        coordinator.request_shutdown(ApplicationStatus::Succeeded);
        assert_eq!(coordinator.status(), Some(ApplicationStatus::Failed));
    }

    #[tokio::test]
    async fn test_wait_observes_status() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();

        let handle = tokio::spawn(async move { waiter.wait_for_shutdown().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        coordinator.request_shutdown(ApplicationStatus::Succeeded);

        assert_eq!(handle.await.unwrap(), ApplicationStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_wait_after_request_returns_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown(ApplicationStatus::Canceled);
        assert_eq!(
            coordinator.wait_for_shutdown().await,
            ApplicationStatus::Canceled
        );
    }
}
