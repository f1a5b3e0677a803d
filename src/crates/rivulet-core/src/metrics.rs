//! Process-wide metric registry.
//!
//! Initialized once by the cluster entry and handed to components as a
//! constructor parameter, never looked up ambiently. Exporters are outside
//! the runtime; this registry only counts.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Named monotonic counters.
#[derive(Default)]
pub struct MetricRegistry {
    counters: RwLock<HashMap<String, Arc<AtomicU64>>>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(name) {
            return Arc::clone(counter);
        }
        let mut counters = self.counters.write();
        Arc::clone(
            counters
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AtomicU64::new(0))),
        )
    }

    pub fn increment(&self, name: &str) {
        self.counter(name).fetch_add(1, Ordering::Relaxed);
    }

    pub fn value(&self, name: &str) -> u64 {
        self.counters
            .read()
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Snapshot of all counters, for logs and tests.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.counters
            .read()
            .iter()
            .map(|(name, counter)| (name.clone(), counter.load(Ordering::Relaxed)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let registry = MetricRegistry::new();
        registry.increment("jobs_submitted");
        registry.increment("jobs_submitted");
        assert_eq!(registry.value("jobs_submitted"), 2);
        assert_eq!(registry.value("unknown"), 0);
    }

    #[test]
    fn test_counter_handle_is_shared() {
        let registry = MetricRegistry::new();
        let handle = registry.counter("checkpoints");
        handle.fetch_add(5, Ordering::Relaxed);
        assert_eq!(registry.value("checkpoints"), 5);
        assert_eq!(registry.snapshot()["checkpoints"], 5);
    }
}
