//! Liveness tracking between component pairs.
//!
//! Two variants exist: [`HeartbeatSender`] actively pings its targets at a
//! fixed interval, [`HeartbeatManager`] passively tracks received
//! heartbeats. Both keep one monitor per peer with at most one outstanding
//! timeout; `notify_heartbeat_timeout` fires exactly once per expiry and is
//! delivered on the owning component's main executor. Payloads are opaque
//! here.

use crate::executor::{MainThreadExecutor, ScheduledTask};
use crate::ids::ResourceId;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Component-side hooks the heartbeat services call into.
pub trait HeartbeatListener<I, O>: Send + Sync {
    /// A heartbeat from `resource_id` carried this payload.
    fn report_payload(&self, resource_id: ResourceId, payload: I);

    /// Produce the payload to send with the next outgoing heartbeat.
    fn retrieve_payload(&self, resource_id: ResourceId) -> O;

    /// `resource_id` missed heartbeats for longer than the timeout.
    fn notify_heartbeat_timeout(&self, resource_id: ResourceId);
}

/// The remote side of a heartbeat relationship.
#[async_trait]
pub trait HeartbeatTarget<O>: Send + Sync {
    /// Deliver a heartbeat response to the peer.
    async fn receive_heartbeat(&self, origin: ResourceId, payload: O);

    /// Ask the peer to respond with a heartbeat of its own.
    async fn request_heartbeat(&self, origin: ResourceId, payload: O);
}

struct Monitor<O> {
    target: Arc<dyn HeartbeatTarget<O>>,
    last_heartbeat: Instant,
    timeout_task: ScheduledTask,
    timed_out: bool,
}

struct Shared<I, O> {
    own_resource_id: ResourceId,
    heartbeat_timeout: Duration,
    listener: Arc<dyn HeartbeatListener<I, O>>,
    executor: MainThreadExecutor,
    monitors: Mutex<HashMap<ResourceId, Monitor<O>>>,
}

impl<I, O> Shared<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    fn reset_timeout(self: &Arc<Self>, resource_id: ResourceId) {
        let mut monitors = self.monitors.lock();
        let Some(monitor) = monitors.get_mut(&resource_id) else {
            return;
        };
        monitor.last_heartbeat = Instant::now();
        monitor.timed_out = false;
        monitor.timeout_task.cancel();
        monitor.timeout_task = self.schedule_timeout(resource_id);
    }

    fn schedule_timeout(self: &Arc<Self>, resource_id: ResourceId) -> ScheduledTask {
        let shared = Arc::clone(self);
        self.executor.schedule(self.heartbeat_timeout, async move {
            shared.fire_timeout(resource_id);
        })
    }

    fn fire_timeout(self: &Arc<Self>, resource_id: ResourceId) {
        {
            let mut monitors = self.monitors.lock();
            match monitors.get_mut(&resource_id) {
                Some(monitor) if !monitor.timed_out => monitor.timed_out = true,
                _ => return,
            }
        }
        warn!(peer = %resource_id, "heartbeat timed out");
        self.listener.notify_heartbeat_timeout(resource_id);
    }
}

/// Passive variant: tracks received heartbeats and answers requests, but
/// never initiates one.
pub struct HeartbeatManager<I, O> {
    shared: Arc<Shared<I, O>>,
}

impl<I, O> HeartbeatManager<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    pub fn new(
        own_resource_id: ResourceId,
        heartbeat_timeout: Duration,
        listener: Arc<dyn HeartbeatListener<I, O>>,
        executor: MainThreadExecutor,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                own_resource_id,
                heartbeat_timeout,
                listener,
                executor,
                monitors: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn monitor_target(&self, resource_id: ResourceId, target: Arc<dyn HeartbeatTarget<O>>) {
        let timeout_task = self.shared.schedule_timeout(resource_id);
        let mut monitors = self.shared.monitors.lock();
        monitors.insert(
            resource_id,
            Monitor {
                target,
                last_heartbeat: Instant::now(),
                timeout_task,
                timed_out: false,
            },
        );
        debug!(peer = %resource_id, "monitoring heartbeat target");
    }

    pub fn unmonitor_target(&self, resource_id: ResourceId) {
        if let Some(monitor) = self.shared.monitors.lock().remove(&resource_id) {
            monitor.timeout_task.cancel();
        }
    }

    pub fn is_monitoring(&self, resource_id: ResourceId) -> bool {
        self.shared.monitors.lock().contains_key(&resource_id)
    }

    /// Instant of the last heartbeat from `resource_id`, if monitored.
    pub fn last_heartbeat(&self, resource_id: ResourceId) -> Option<Instant> {
        self.shared
            .monitors
            .lock()
            .get(&resource_id)
            .map(|m| m.last_heartbeat)
    }

    /// A heartbeat response arrived from the peer.
    pub fn receive_heartbeat(&self, resource_id: ResourceId, payload: I) {
        if !self.is_monitoring(resource_id) {
            return;
        }
        self.shared.reset_timeout(resource_id);
        self.shared.listener.report_payload(resource_id, payload);
    }

    /// A heartbeat request arrived from the peer; reply symmetrically.
    pub async fn request_heartbeat(&self, resource_id: ResourceId, payload: I) {
        let target = {
            let monitors = self.shared.monitors.lock();
            match monitors.get(&resource_id) {
                Some(monitor) => Arc::clone(&monitor.target),
                None => return,
            }
        };
        self.shared.reset_timeout(resource_id);
        self.shared.listener.report_payload(resource_id, payload);

        let response = self.shared.listener.retrieve_payload(resource_id);
        target
            .receive_heartbeat(self.shared.own_resource_id, response)
            .await;
    }

    pub fn stop(&self) {
        let mut monitors = self.shared.monitors.lock();
        for (_, monitor) in monitors.drain() {
            monitor.timeout_task.cancel();
        }
    }
}

/// Active variant: everything the passive manager does, plus a ping loop at
/// `heartbeat_interval`.
pub struct HeartbeatSender<I, O> {
    manager: HeartbeatManager<I, O>,
    ping_loop: tokio::task::JoinHandle<()>,
}

impl<I, O> HeartbeatSender<I, O>
where
    I: Send + 'static,
    O: Send + Clone + 'static,
{
    pub fn new(
        own_resource_id: ResourceId,
        heartbeat_interval: Duration,
        heartbeat_timeout: Duration,
        listener: Arc<dyn HeartbeatListener<I, O>>,
        executor: MainThreadExecutor,
    ) -> Self {
        let manager = HeartbeatManager::new(own_resource_id, heartbeat_timeout, listener, executor);

        let shared = Arc::clone(&manager.shared);
        let ping_loop = tokio::spawn(async move {
            let mut interval = tokio::time::interval(heartbeat_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let targets: Vec<(ResourceId, Arc<dyn HeartbeatTarget<O>>)> = shared
                    .monitors
                    .lock()
                    .iter()
                    .filter(|(_, m)| !m.timed_out)
                    .map(|(id, m)| (*id, Arc::clone(&m.target)))
                    .collect();
                for (resource_id, target) in targets {
                    let payload = shared.listener.retrieve_payload(resource_id);
                    target
                        .request_heartbeat(shared.own_resource_id, payload)
                        .await;
                }
            }
        });

        Self { manager, ping_loop }
    }

    pub fn manager(&self) -> &HeartbeatManager<I, O> {
        &self.manager
    }

    pub fn monitor_target(&self, resource_id: ResourceId, target: Arc<dyn HeartbeatTarget<O>>) {
        self.manager.monitor_target(resource_id, target);
    }

    pub fn unmonitor_target(&self, resource_id: ResourceId) {
        self.manager.unmonitor_target(resource_id);
    }

    pub fn receive_heartbeat(&self, resource_id: ResourceId, payload: I) {
        self.manager.receive_heartbeat(resource_id, payload);
    }

    pub fn stop(&self) {
        self.ping_loop.abort();
        self.manager.stop();
    }
}

impl<I, O> Drop for HeartbeatSender<I, O> {
    fn drop(&mut self) {
        self.ping_loop.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        timeouts: AtomicUsize,
        payloads: AtomicUsize,
    }

    impl CountingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                timeouts: AtomicUsize::new(0),
                payloads: AtomicUsize::new(0),
            })
        }
    }

    impl HeartbeatListener<u32, u32> for CountingListener {
        fn report_payload(&self, _resource_id: ResourceId, _payload: u32) {
            self.payloads.fetch_add(1, Ordering::SeqCst);
        }

        fn retrieve_payload(&self, _resource_id: ResourceId) -> u32 {
            7
        }

        fn notify_heartbeat_timeout(&self, _resource_id: ResourceId) {
            self.timeouts.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NullTarget;

    #[async_trait]
    impl HeartbeatTarget<u32> for NullTarget {
        async fn receive_heartbeat(&self, _origin: ResourceId, _payload: u32) {}
        async fn request_heartbeat(&self, _origin: ResourceId, _payload: u32) {}
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_exactly_once() {
        let listener = CountingListener::new();
        let executor = MainThreadExecutor::new("hb-test");
        let manager = HeartbeatManager::new(
            ResourceId::new(),
            Duration::from_millis(100),
            listener.clone(),
            executor.clone(),
        );

        let peer = ResourceId::new();
        manager.monitor_target(peer, Arc::new(NullTarget));

        tokio::time::advance(Duration::from_millis(300)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);

        // No more firings without a fresh heartbeat.
        tokio::time::advance(Duration::from_millis(300)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_defers_timeout() {
        let listener = CountingListener::new();
        let executor = MainThreadExecutor::new("hb-test");
        let manager = HeartbeatManager::new(
            ResourceId::new(),
            Duration::from_millis(100),
            listener.clone(),
            executor.clone(),
        );

        let peer = ResourceId::new();
        manager.monitor_target(peer, Arc::new(NullTarget));

        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(60)).await;
            manager.receive_heartbeat(peer, 1);
        }
        executor.run(|| ()).await.unwrap();
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
        assert_eq!(listener.payloads.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmonitored_peer_is_ignored() {
        let listener = CountingListener::new();
        let executor = MainThreadExecutor::new("hb-test");
        let manager = HeartbeatManager::new(
            ResourceId::new(),
            Duration::from_millis(100),
            listener.clone(),
            executor.clone(),
        );

        manager.receive_heartbeat(ResourceId::new(), 1);
        executor.run(|| ()).await.unwrap();
        assert_eq!(listener.payloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmonitor_cancels_timeout() {
        let listener = CountingListener::new();
        let executor = MainThreadExecutor::new("hb-test");
        let manager = HeartbeatManager::new(
            ResourceId::new(),
            Duration::from_millis(100),
            listener.clone(),
            executor.clone(),
        );

        let peer = ResourceId::new();
        manager.monitor_target(peer, Arc::new(NullTarget));
        manager.unmonitor_target(peer);

        tokio::time::advance(Duration::from_millis(500)).await;
        executor.run(|| ()).await.unwrap();
        assert_eq!(listener.timeouts.load(Ordering::SeqCst), 0);
    }
}
