//! Resource profiles and budget accounting.

use crate::error::{Result, RuntimeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Semantic description of the resources a slot provides or a task demands.
///
/// Profiles form a partial order: `a.matches(&b)` holds iff every dimension
/// of `a` is at least the corresponding dimension of `b`. The all-zero
/// profile is the `UNKNOWN` sentinel, matched by anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_cores: f64,
    pub task_heap_bytes: u64,
    pub managed_memory_bytes: u64,
    pub network_memory_bytes: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, u64>,
}

impl ResourceProfile {
    pub fn new(cpu_cores: f64, task_heap_bytes: u64) -> Self {
        Self {
            cpu_cores,
            task_heap_bytes,
            ..Default::default()
        }
    }

    /// The sentinel profile with no stated requirements.
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn is_unknown(&self) -> bool {
        self.cpu_cores == 0.0
            && self.task_heap_bytes == 0
            && self.managed_memory_bytes == 0
            && self.network_memory_bytes == 0
            && self.extended.is_empty()
    }

    pub fn with_managed_memory(mut self, bytes: u64) -> Self {
        self.managed_memory_bytes = bytes;
        self
    }

    pub fn with_network_memory(mut self, bytes: u64) -> Self {
        self.network_memory_bytes = bytes;
        self
    }

    pub fn with_extended(mut self, name: impl Into<String>, amount: u64) -> Self {
        self.extended.insert(name.into(), amount);
        self
    }

    /// Whether this profile can satisfy `required`.
    pub fn matches(&self, required: &ResourceProfile) -> bool {
        if self.cpu_cores < required.cpu_cores
            || self.task_heap_bytes < required.task_heap_bytes
            || self.managed_memory_bytes < required.managed_memory_bytes
            || self.network_memory_bytes < required.network_memory_bytes
        {
            return false;
        }
        required
            .extended
            .iter()
            .all(|(name, amount)| self.extended.get(name).copied().unwrap_or(0) >= *amount)
    }

    pub fn add(&self, other: &ResourceProfile) -> ResourceProfile {
        let mut extended = self.extended.clone();
        for (name, amount) in &other.extended {
            *extended.entry(name.clone()).or_insert(0) += amount;
        }
        ResourceProfile {
            cpu_cores: self.cpu_cores + other.cpu_cores,
            task_heap_bytes: self.task_heap_bytes + other.task_heap_bytes,
            managed_memory_bytes: self.managed_memory_bytes + other.managed_memory_bytes,
            network_memory_bytes: self.network_memory_bytes + other.network_memory_bytes,
            extended,
        }
    }

    /// Subtract `other` from this profile; fails if any dimension would go
    /// negative.
    pub fn try_subtract(&self, other: &ResourceProfile) -> Result<ResourceProfile> {
        if !self.matches(other) {
            return Err(RuntimeError::ResourceOverallocation(format!(
                "cannot subtract {other} from {self}"
            )));
        }
        let mut extended = self.extended.clone();
        for (name, amount) in &other.extended {
            if let Some(have) = extended.get_mut(name) {
                *have -= amount;
            }
        }
        Ok(ResourceProfile {
            cpu_cores: self.cpu_cores - other.cpu_cores,
            task_heap_bytes: self.task_heap_bytes - other.task_heap_bytes,
            managed_memory_bytes: self.managed_memory_bytes - other.managed_memory_bytes,
            network_memory_bytes: self.network_memory_bytes - other.network_memory_bytes,
            extended,
        })
    }
}

impl fmt::Display for ResourceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unknown() {
            return write!(f, "ResourceProfile(unknown)");
        }
        write!(
            f,
            "ResourceProfile(cpu={}, heap={}B, managed={}B, network={}B)",
            self.cpu_cores, self.task_heap_bytes, self.managed_memory_bytes, self.network_memory_bytes
        )
    }
}

/// Reserve/release accounting against a fixed total budget.
///
/// Owned by the worker's slot table: the sum of all reserved profiles can
/// never exceed the worker's declared total.
#[derive(Debug)]
pub struct ResourceBudgetManager {
    total: ResourceProfile,
    available: Mutex<ResourceProfile>,
}

impl ResourceBudgetManager {
    pub fn new(total: ResourceProfile) -> Self {
        let available = total.clone();
        Self {
            total,
            available: Mutex::new(available),
        }
    }

    pub fn total(&self) -> &ResourceProfile {
        &self.total
    }

    pub fn available(&self) -> ResourceProfile {
        self.available.lock().clone()
    }

    /// Reserve `profile` out of the remaining budget.
    pub fn reserve(&self, profile: &ResourceProfile) -> Result<()> {
        let mut available = self.available.lock();
        *available = available.try_subtract(profile)?;
        Ok(())
    }

    /// Return a previously reserved `profile` to the budget.
    pub fn release(&self, profile: &ResourceProfile) {
        let mut available = self.available.lock();
        *available = available.add(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn profile(cpu: f64, heap: u64) -> ResourceProfile {
        ResourceProfile::new(cpu, heap)
    }

    #[test]
    fn test_matches_is_per_dimension() {
        let big = profile(2.0, 512).with_managed_memory(100);
        let small = profile(1.0, 256);
        assert!(big.matches(&small));
        assert!(!small.matches(&big));
    }

    #[test]
    fn test_unknown_is_matched_by_anything() {
        assert!(profile(0.5, 1).matches(&ResourceProfile::unknown()));
        assert!(ResourceProfile::unknown().matches(&ResourceProfile::unknown()));
    }

    #[test]
    fn test_extended_resources_participate_in_matching() {
        let with_gpu = profile(1.0, 256).with_extended("gpu", 1);
        let needs_gpu = ResourceProfile::unknown().with_extended("gpu", 1);
        let needs_two = ResourceProfile::unknown().with_extended("gpu", 2);
        assert!(with_gpu.matches(&needs_gpu));
        assert!(!with_gpu.matches(&needs_two));
        assert!(!profile(1.0, 256).matches(&needs_gpu));
    }

    #[test]
    fn test_budget_manager_enforces_total() {
        let budget = ResourceBudgetManager::new(profile(2.0, 512));
        budget.reserve(&profile(1.0, 256)).unwrap();
        budget.reserve(&profile(1.0, 256)).unwrap();
        assert!(budget.reserve(&profile(0.5, 1)).is_err());

        budget.release(&profile(1.0, 256));
        budget.reserve(&profile(1.0, 128)).unwrap();
    }

    proptest! {
        #[test]
        fn prop_subtract_then_add_is_identity(cpu in 0.0f64..8.0, heap in 0u64..1 << 30) {
            let total = profile(8.0, 1 << 30);
            let part = profile(cpu, heap);
            let rest = total.try_subtract(&part).unwrap();
            let back = rest.add(&part);
            prop_assert!((back.cpu_cores - total.cpu_cores).abs() < 1e-9);
            prop_assert_eq!(back.task_heap_bytes, total.task_heap_bytes);
        }

        #[test]
        fn prop_matches_is_reflexive(cpu in 0.0f64..8.0, heap in 0u64..1 << 30) {
            let p = profile(cpu, heap);
            prop_assert!(p.matches(&p));
        }
    }
}
