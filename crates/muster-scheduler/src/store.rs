//! File-based task store — one directory tree per owning agent.
//!
//! ```text
//! <data_dir>/<agent_id>/tasks/<task_id>/task.json      task definition
//! <data_dir>/<agent_id>/tasks/<task_id>/runs.json      bounded run history
//! <data_dir>/<agent_id>/tasks/<task_id>/trigger.json   manual-trigger marker
//! ```
//!
//! Human-readable JSON, git-friendly. Every write goes through a temp file
//! and an atomic rename, so concurrent readers (API/CLI processes) never
//! see a partial record.

use std::path::{Path, PathBuf};

use muster_core::error::{MusterError, Result};

use crate::tasks::{RunRecord, ScheduledTask, TriggerKind};

const TASK_FILE: &str = "task.json";
const RUNS_FILE: &str = "runs.json";
const TRIGGER_FILE: &str = "trigger.json";

/// A trigger marker left by the CLI for the daemon to pick up.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TriggerMarker {
    pub task_id: String,
    pub trigger: TriggerKind,
    pub requested_at: chrono::DateTime<chrono::Utc>,
}

/// Durable CRUD over per-agent task directories plus run-history retention.
pub struct TaskStore {
    data_dir: PathBuf,
    run_history_limit: usize,
}

impl TaskStore {
    pub fn new(data_dir: &Path, run_history_limit: usize) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            run_history_limit,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn task_dir(&self, agent_id: &str, task_id: &str) -> PathBuf {
        self.data_dir.join(agent_id).join("tasks").join(task_id)
    }

    /// Create a new task. Rejects a duplicate task_id for the same agent.
    pub fn create(&self, task: &ScheduledTask) -> Result<()> {
        let dir = self.task_dir(&task.agent_id, &task.task_id);
        if dir.join(TASK_FILE).exists() {
            return Err(MusterError::Validation(format!(
                "task '{}' already exists for agent '{}'",
                task.task_id, task.agent_id
            )));
        }
        std::fs::create_dir_all(&dir)?;
        write_json(&dir.join(TASK_FILE), task)?;
        tracing::info!("📅 task created: {}/{}", task.agent_id, task.task_id);
        Ok(())
    }

    /// Load one task.
    pub fn load(&self, agent_id: &str, task_id: &str) -> Result<ScheduledTask> {
        let path = self.task_dir(agent_id, task_id).join(TASK_FILE);
        if !path.exists() {
            return Err(MusterError::NotFound(format!(
                "task '{task_id}' for agent '{agent_id}'"
            )));
        }
        read_json(&path)
    }

    /// Persist the full task record (update-by-copy callers pass the merged value).
    pub fn save(&self, task: &ScheduledTask) -> Result<()> {
        let dir = self.task_dir(&task.agent_id, &task.task_id);
        if !dir.exists() {
            return Err(MusterError::NotFound(format!(
                "task '{}' for agent '{}'",
                task.task_id, task.agent_id
            )));
        }
        write_json(&dir.join(TASK_FILE), task)
    }

    /// Remove the task directory and everything in it, history included.
    pub fn delete(&self, agent_id: &str, task_id: &str) -> Result<()> {
        let dir = self.task_dir(agent_id, task_id);
        if !dir.exists() {
            return Err(MusterError::NotFound(format!(
                "task '{task_id}' for agent '{agent_id}'"
            )));
        }
        std::fs::remove_dir_all(&dir)?;
        tracing::info!("🗑️ task deleted: {agent_id}/{task_id}");
        Ok(())
    }

    /// List all tasks for one agent. An agent with no directory has no tasks.
    pub fn list(&self, agent_id: &str) -> Result<Vec<ScheduledTask>> {
        let tasks_dir = self.data_dir.join(agent_id).join("tasks");
        let mut tasks = Vec::new();
        let entries = match std::fs::read_dir(&tasks_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(tasks),
        };
        for entry in entries.flatten() {
            let path = entry.path().join(TASK_FILE);
            if path.exists() {
                match read_json::<ScheduledTask>(&path) {
                    Ok(task) => tasks.push(task),
                    Err(e) => tracing::warn!("skipping unreadable task at {:?}: {e}", entry.path()),
                }
            }
        }
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    /// Agent ids that currently have a directory under the store.
    pub fn list_agents(&self) -> Result<Vec<String>> {
        let mut agents = Vec::new();
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(_) => return Ok(agents),
        };
        for entry in entries.flatten() {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    agents.push(name.to_string());
                }
            }
        }
        agents.sort();
        Ok(agents)
    }

    /// Find which agent owns a task id, if any. Used for ownership checks.
    pub fn find_owner(&self, task_id: &str) -> Result<Option<String>> {
        for agent_id in self.list_agents()? {
            if self.task_dir(&agent_id, task_id).join(TASK_FILE).exists() {
                return Ok(Some(agent_id));
            }
        }
        Ok(None)
    }

    /// Append a run record, trimming to the retention bound (oldest first).
    pub fn append_run(&self, agent_id: &str, record: &RunRecord) -> Result<()> {
        let path = self.task_dir(agent_id, &record.task_id).join(RUNS_FILE);
        let mut runs: Vec<RunRecord> = if path.exists() {
            read_json(&path)?
        } else {
            Vec::new()
        };
        runs.push(record.clone());
        if runs.len() > self.run_history_limit {
            let excess = runs.len() - self.run_history_limit;
            runs.drain(..excess);
        }
        write_json(&path, &runs)
    }

    /// Most recent runs, newest first, capped at `limit`.
    pub fn run_history(
        &self,
        agent_id: &str,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>> {
        let path = self.task_dir(agent_id, task_id).join(RUNS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut runs: Vec<RunRecord> = read_json(&path)?;
        runs.reverse();
        runs.truncate(limit);
        Ok(runs)
    }

    /// Leave a trigger marker for the daemon's intake scan.
    pub fn request_trigger(&self, agent_id: &str, task_id: &str, trigger: TriggerKind) -> Result<()> {
        let dir = self.task_dir(agent_id, task_id);
        if !dir.exists() {
            return Err(MusterError::NotFound(format!(
                "task '{task_id}' for agent '{agent_id}'"
            )));
        }
        let marker = TriggerMarker {
            task_id: task_id.to_string(),
            trigger,
            requested_at: chrono::Utc::now(),
        };
        write_json(&dir.join(TRIGGER_FILE), &marker)
    }

    /// Consume all pending trigger markers for an agent.
    pub fn take_triggers(&self, agent_id: &str) -> Result<Vec<TriggerMarker>> {
        let mut markers = Vec::new();
        for task in self.list(agent_id)? {
            let path = self.task_dir(agent_id, &task.task_id).join(TRIGGER_FILE);
            if path.exists() {
                match read_json::<TriggerMarker>(&path) {
                    Ok(marker) => markers.push(marker),
                    Err(e) => tracing::warn!("dropping unreadable trigger marker: {e}"),
                }
                std::fs::remove_file(&path)?;
            }
        }
        Ok(markers)
    }
}

/// Atomic JSON write: temp file in the same directory, then rename.
fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| MusterError::Store(format!("serialize {}: {e}", path.display())))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| MusterError::Store(format!("parse {}: {e}", path.display())))
}
