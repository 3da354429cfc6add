//! Task definitions — the core data model for scheduled work.
//!
//! Records are plain values: every mutation goes through update-by-copy so
//! the control loop and dispatcher never alias a half-edited task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// When/how a task triggers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Run every N seconds. Fires immediately when never run.
    Interval { every_secs: u64 },
    /// Standard five/six-field cron expression.
    Cron { expression: String },
    /// Run once at a fixed time, then disable.
    Once { at: DateTime<Utc> },
    /// No timer — fires only via explicit trigger or external event.
    EventOnly,
}

/// A scheduled task, owned by exactly one agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledTask {
    /// Unique within the owning agent; doubles as the directory name.
    pub task_id: String,
    /// Owning agent.
    pub agent_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub schedule: Schedule,
    /// Explicit skill binding. Absent = resolved at fire time by the matcher.
    #[serde(default)]
    pub skill_id: Option<String>,
    pub enabled: bool,
    /// Placeholder-bearing context, resolved fresh before every fire.
    /// Ordered map — resolution output keeps the authored key order.
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub instructions: String,
    pub created_at: DateTime<Utc>,
    /// Last fire attempt (success or failure).
    #[serde(default)]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub run_count: u32,
}

impl ScheduledTask {
    pub fn new(agent_id: &str, task_id: &str, name: &str, schedule: Schedule) -> Self {
        Self {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            name: name.to_string(),
            description: String::new(),
            schedule,
            skill_id: None,
            enabled: true,
            context: Map::new(),
            instructions: String::new(),
            created_at: Utc::now(),
            last_run_at: None,
            run_count: 0,
        }
    }

    /// Apply a partial update, returning the merged copy.
    pub fn merged(&self, patch: &TaskUpdate) -> Self {
        let mut next = self.clone();
        if let Some(name) = &patch.name {
            next.name = name.clone();
        }
        if let Some(description) = &patch.description {
            next.description = description.clone();
        }
        if let Some(schedule) = &patch.schedule {
            next.schedule = schedule.clone();
        }
        if let Some(skill_id) = &patch.skill_id {
            next.skill_id = skill_id.clone();
        }
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(context) = &patch.context {
            next.context = context.clone();
        }
        next
    }
}

/// Partial field merge for `update_task`. Instructions are deliberately
/// absent — large content edits go through `update_instructions` so they
/// cannot race a concurrent config edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub schedule: Option<Schedule>,
    /// `Some(None)` clears an explicit binding back to matcher resolution.
    pub skill_id: Option<Option<String>>,
    pub enabled: Option<bool>,
    pub context: Option<Map<String, Value>>,
}

/// Why a task fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Scheduled,
    Manual,
    Event,
}

/// Terminal state of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Error,
}

/// One persisted outcome of a task firing. Append-only, bounded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub task_id: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub trigger: TriggerKind,
    pub status: RunStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunRecord {
    pub fn new(
        task_id: &str,
        started_at: DateTime<Utc>,
        trigger: TriggerKind,
        status: RunStatus,
        error: Option<String>,
    ) -> Self {
        let duration_ms = (Utc::now() - started_at).num_milliseconds().max(0) as u64;
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.to_string(),
            started_at,
            duration_ms,
            trigger,
            status,
            error,
        }
    }
}
