//! Runtime configuration schema.
//!
//! Loaded from TOML by the binaries; tests build it by struct literal and
//! shrink the timeouts. Components receive the typed sub-structs by value,
//! never the file path.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration shared by master and worker processes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Advertised RPC address of this process; the bootstrap writes the
    /// bound value back here so later components advertise the right one.
    pub address: String,
    pub rpc_timeout_ms: u64,
    pub slot_request_timeout_ms: u64,
    pub idle_slot_timeout_ms: u64,
    pub batch_slot_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub restart_delay_ms: u64,
    /// Task-failure restarts a job tolerates before failing for good.
    pub max_restarts: u32,
    pub checkpoint: CheckpointSettings,
    pub network: NetworkSettings,
    pub slot_pool: SlotPoolSettings,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0".to_string(),
            rpc_timeout_ms: 10_000,
            slot_request_timeout_ms: 300_000,
            idle_slot_timeout_ms: 50_000,
            batch_slot_timeout_ms: 300_000,
            heartbeat_interval_ms: 10_000,
            heartbeat_timeout_ms: 50_000,
            restart_delay_ms: 1_000,
            max_restarts: 10,
            checkpoint: CheckpointSettings::default(),
            network: NetworkSettings::default(),
            slot_pool: SlotPoolSettings::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        toml::from_str(&raw).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn slot_request_timeout(&self) -> Duration {
        Duration::from_millis(self.slot_request_timeout_ms)
    }

    pub fn idle_slot_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_slot_timeout_ms)
    }

    pub fn batch_slot_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_slot_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// Sanity checks applied once at bootstrap.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_timeout_ms < self.heartbeat_interval_ms {
            return Err(RuntimeError::Config(
                "heartbeat_timeout_ms must be at least heartbeat_interval_ms".into(),
            ));
        }
        if self.checkpoint.max_concurrent == 0 {
            return Err(RuntimeError::Config(
                "checkpoint.max_concurrent must be at least 1".into(),
            ));
        }
        if self.network.buffer_size == 0 {
            return Err(RuntimeError::Config("network.buffer_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Checkpoint coordinator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_concurrent: usize,
    /// Minimum pause between the end of one checkpoint and the next trigger.
    pub min_pause_ms: u64,
    pub max_retained: usize,
    pub unaligned: bool,
}

impl Default for CheckpointSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 600_000,
            max_concurrent: 1,
            min_pause_ms: 0,
            max_retained: 3,
            unaligned: true,
        }
    }
}

impl CheckpointSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn min_pause(&self) -> Duration {
        Duration::from_millis(self.min_pause_ms)
    }
}

/// Data-path settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub buffer_size: usize,
    pub buffers_per_channel: usize,
    /// Credit the receiver advertises per channel before consuming anything.
    pub initial_credit: u32,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            buffer_size: 32 * 1024,
            buffers_per_channel: 8,
            initial_credit: 8,
        }
    }
}

/// Slot pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlotPoolSettings {
    /// When true, a hard resource-manager failure fails pending batch
    /// requests immediately instead of only when they become unfulfillable.
    pub batch_request_fails_on_rm_failure: bool,
}

impl Default for SlotPoolSettings {
    fn default() -> Self {
        Self {
            batch_request_fails_on_rm_failure: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_tight_heartbeat() {
        let config = RuntimeConfig {
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 500,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_toml_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "rpc_timeout_ms = 1234\n[checkpoint]\ninterval_ms = 50"
        )
        .unwrap();

        let config = RuntimeConfig::load(file.path()).unwrap();
        assert_eq!(config.rpc_timeout_ms, 1234);
        assert_eq!(config.checkpoint.interval_ms, 50);
        // Untouched fields keep their defaults.
        assert_eq!(config.heartbeat_timeout_ms, 50_000);
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/nonexistent/rivulet.toml").is_err());
    }
}
