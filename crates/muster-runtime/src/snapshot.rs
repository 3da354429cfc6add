//! Runtime liveness snapshot — the only agent state that survives a
//! process restart.
//!
//! Written atomically on a fixed cadence. On start, an agent is restored
//! `active` only when its snapshot is both marked active and recent enough
//! (inside the restore window); everything else starts inactive and must
//! be explicitly started again.

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use muster_core::error::{MusterError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSnapshot {
    pub agent_id: String,
    pub active: bool,
    pub heartbeat_secs: u64,
    #[serde(default)]
    pub last_heartbeat_emitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSnapshot {
    pub written_at: DateTime<Utc>,
    pub agents: Vec<AgentSnapshot>,
}

impl RuntimeSnapshot {
    pub fn new(agents: Vec<AgentSnapshot>) -> Self {
        Self {
            written_at: Utc::now(),
            agents,
        }
    }

    /// Atomic write: temp file, then rename.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MusterError::Store(format!("serialize snapshot: {e}")))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path)?;
        let snapshot = serde_json::from_str(&content)
            .map_err(|e| MusterError::Store(format!("parse snapshot: {e}")))?;
        Ok(Some(snapshot))
    }

    /// Whether this snapshot is recent enough to restore agents from.
    pub fn within_window(&self, now: DateTime<Utc>, window_secs: u64) -> bool {
        now - self.written_at <= Duration::seconds(window_secs as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_written_at(written_at: DateTime<Utc>) -> RuntimeSnapshot {
        RuntimeSnapshot {
            written_at,
            agents: vec![AgentSnapshot {
                agent_id: "a1".into(),
                active: true,
                heartbeat_secs: 60,
                last_heartbeat_emitted_at: None,
            }],
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        let snapshot = snapshot_written_at(Utc::now());
        snapshot.save(&path).unwrap();

        let loaded = RuntimeSnapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.agents.len(), 1);
        assert_eq!(loaded.agents[0].agent_id, "a1");
        assert!(loaded.agents[0].active);
    }

    #[test]
    fn missing_snapshot_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(RuntimeSnapshot::load(&dir.path().join("runtime.json"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn restore_window_boundaries() {
        let now = Utc::now();
        // 5 minutes old: inside the 10-minute window.
        let snapshot = snapshot_written_at(now - Duration::seconds(300));
        assert!(snapshot.within_window(now, 600));
        // 700 seconds old: outside.
        let snapshot = snapshot_written_at(now - Duration::seconds(700));
        assert!(!snapshot.within_window(now, 600));
    }
}
