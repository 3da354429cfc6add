//! Muster configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{MusterError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MusterConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
}

impl MusterConfig {
    /// Load config from the default path (~/.muster/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MusterError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| MusterError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| MusterError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Muster home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".muster")
    }
}

/// Control loop + dispatcher tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Control loop cadence in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Worker pool size shared by all agents.
    #[serde(default = "default_worker_slots")]
    pub worker_slots: usize,
    /// Per-agent pending event queue capacity.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Liveness snapshot write interval in seconds.
    #[serde(default = "default_snapshot_secs")]
    pub snapshot_secs: u64,
    /// How long a snapshot stays restorable after a restart, in seconds.
    #[serde(default = "default_restore_window_secs")]
    pub restore_window_secs: u64,
    /// Hard deadline on a single executor call, in seconds.
    /// 0 disables the deadline — a hung executor then parks its agent
    /// Busy until restart, matching the historical behavior.
    #[serde(default)]
    pub executor_timeout_secs: u64,
    /// Default heartbeat interval for newly started agents, in seconds.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
}

fn default_tick_secs() -> u64 {
    1
}
fn default_worker_slots() -> usize {
    4
}
fn default_queue_capacity() -> usize {
    20
}
fn default_snapshot_secs() -> u64 {
    30
}
fn default_restore_window_secs() -> u64 {
    600
}
fn default_heartbeat_secs() -> u64 {
    1800
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            worker_slots: default_worker_slots(),
            queue_capacity: default_queue_capacity(),
            snapshot_secs: default_snapshot_secs(),
            restore_window_secs: default_restore_window_secs(),
            executor_timeout_secs: 0,
            heartbeat_secs: default_heartbeat_secs(),
        }
    }
}

/// Task store layout + retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root of the per-agent task directory tree.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// How many run records to retain per task.
    #[serde(default = "default_run_history_limit")]
    pub run_history_limit: usize,
}

fn default_data_dir() -> String {
    "~/.muster/agents".into()
}
fn default_run_history_limit() -> usize {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            run_history_limit: default_run_history_limit(),
        }
    }
}

/// Which executor the daemon wires in.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    /// External command to run per execution (request on stdin as JSON,
    /// outcome on stdout). Empty = log-only stub executor.
    #[serde(default)]
    pub command: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_tunables() {
        let cfg = MusterConfig::default();
        assert_eq!(cfg.runtime.tick_secs, 1);
        assert_eq!(cfg.runtime.worker_slots, 4);
        assert_eq!(cfg.runtime.queue_capacity, 20);
        assert_eq!(cfg.runtime.restore_window_secs, 600);
        assert_eq!(cfg.runtime.executor_timeout_secs, 0);
        assert_eq!(cfg.store.run_history_limit, 50);
    }

    #[test]
    fn load_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[runtime]\nworker_slots = 8\n").unwrap();
        let cfg = MusterConfig::load_from(&path).unwrap();
        assert_eq!(cfg.runtime.worker_slots, 8);
        assert_eq!(cfg.runtime.tick_secs, 1);
    }

    #[test]
    fn bad_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "runtime = nope").unwrap();
        assert!(matches!(
            MusterConfig::load_from(&path),
            Err(MusterError::Config(_))
        ));
    }
}
