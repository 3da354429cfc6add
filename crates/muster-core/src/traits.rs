//! Collaborator traits — the seams between the scheduling core and the
//! LLM-driven world around it.
//!
//! The core decides *when* and *in what order* work happens and *what
//! context* is handed over; everything behind these traits (prompt
//! construction, tool calling, skill content, secrets) lives elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Why an execution was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Periodic agent wake-up, independent of any task.
    Heartbeat,
    /// A scheduled task came due.
    Task,
    /// Manual or external trigger.
    Trigger,
}

/// One unit of work handed to the executor. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub agent_id: String,
    pub kind: ExecutionKind,
    /// Task id for task-backed executions, absent for heartbeats.
    pub task_id: Option<String>,
    pub instructions: String,
    /// Fully resolved context — no placeholder tokens remain.
    pub context: Value,
    pub skill_content: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Terminal state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Completed,
    Error,
}

/// What came back from the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ExecutionOutcome {
    pub fn completed(output: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Completed,
            output: Some(output.into()),
            error: None,
        }
    }

    pub fn error(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Error,
            output: None,
            error: Some(reason.into()),
        }
    }
}

/// The agentic-loop entry point. Opaque to the scheduler: it may take
/// minutes, call tools, or fail — the core only records the outcome.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome>;
}

/// Resolves which skill backs a task, and loads its content.
/// Only consulted when a task carries no explicit `skill_id`.
#[async_trait]
pub trait SkillMatcher: Send + Sync {
    /// Pick a skill for a task description. `None` = run without a skill.
    async fn match_skill(&self, task_description: &str) -> Option<String>;

    /// Load the content for a skill id. `None` = unknown skill.
    async fn skill_content(&self, skill_id: &str) -> Option<String>;
}

/// Backs the `CREDENTIALS` placeholder handler.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Fetch a named credential set for an agent. `None` = not configured.
    async fn credentials(&self, agent_id: &str, name: &str) -> Option<Map<String, Value>>;
}

/// Backs the `STATE` placeholder handler. Written by the agent's own tool
/// layer between runs; read-only from the scheduler's side.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn state(&self, agent_id: &str, task_id: &str) -> Map<String, Value>;
}

/// No-op collaborators, used by CLI paths and tests that never fire work.

pub struct NullExecutor;

#[async_trait]
impl Executor for NullExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
        Ok(ExecutionOutcome::completed(format!(
            "noop: {} ({:?})",
            request.agent_id, request.kind
        )))
    }
}

pub struct NullSkillMatcher;

#[async_trait]
impl SkillMatcher for NullSkillMatcher {
    async fn match_skill(&self, _task_description: &str) -> Option<String> {
        None
    }

    async fn skill_content(&self, _skill_id: &str) -> Option<String> {
        None
    }
}

pub struct NullCredentialStore;

#[async_trait]
impl CredentialStore for NullCredentialStore {
    async fn credentials(&self, _agent_id: &str, _name: &str) -> Option<Map<String, Value>> {
        None
    }
}

pub struct NullStateStore;

#[async_trait]
impl StateStore for NullStateStore {
    async fn state(&self, _agent_id: &str, _task_id: &str) -> Map<String, Value> {
        Map::new()
    }
}
