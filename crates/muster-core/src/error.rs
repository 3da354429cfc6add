//! Error taxonomy for the runtime core.
//!
//! The split mirrors where each failure is handled:
//! - `Validation` and `Ownership` are rejected synchronously at the API
//!   boundary and never reach the control loop.
//! - `Resolution` and `Executor` are caught per-task at fire/harvest time
//!   and downgraded to an `error` run record.
//! - `Store`/`Io` fail the whole operation atomically (temp+rename writes
//!   leave no partial records behind).

use thiserror::Error;

/// Convenience alias used across all Muster crates.
pub type Result<T> = std::result::Result<T, MusterError>;

#[derive(Debug, Error)]
pub enum MusterError {
    /// Bad schedule, missing/duplicate task id, invalid cron expression.
    #[error("validation error: {0}")]
    Validation(String),

    /// A required placeholder could not be resolved at fire time.
    #[error("resolution error for '{token}': {reason}")]
    Resolution { token: String, reason: String },

    /// The executor collaborator failed or raised.
    #[error("executor error: {0}")]
    Executor(String),

    /// An agent tried to act on a task owned by a different agent.
    #[error("agent '{agent_id}' does not own task '{task_id}'")]
    Ownership { agent_id: String, task_id: String },

    /// Task or agent could not be identified.
    #[error("not found: {0}")]
    NotFound(String),

    /// Persistence failure (serialization, layout).
    #[error("store error: {0}")]
    Store(String),

    /// Raw filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration load/parse failure.
    #[error("config error: {0}")]
    Config(String),
}

impl MusterError {
    /// Whether this failure should downgrade to an `error` run record
    /// instead of propagating (the task stays scheduled either way).
    pub fn is_recorded_at_fire(&self) -> bool {
        matches!(
            self,
            MusterError::Resolution { .. } | MusterError::Executor(_)
        )
    }
}
