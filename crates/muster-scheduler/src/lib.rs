//! # Muster Scheduler
//!
//! Durable scheduled-task layer: per-agent task directories, next-run
//! computation, bounded run history, and the placeholder resolution that
//! prepares task context before dispatch.
//!
//! ## Architecture
//! ```text
//! TaskScheduler
//!   ├── TaskStore: <data_dir>/<agent>/tasks/<task>/{task.json, runs.json}
//!   ├── calc: Interval / Cron / Once / EventOnly → next fire time
//!   ├── ContextResolver: "$CREDENTIALS:github$" → concrete values
//!   └── fire → SkillMatcher → Executor → RunRecord (bounded, 50)
//! ```
//!
//! The scheduler never enforces concurrency — the runtime owns the
//! one-in-flight-per-agent invariant and calls in here to fire.

pub mod calc;
pub mod resolver;
pub mod scheduler;
pub mod store;
pub mod tasks;

pub use resolver::ContextResolver;
pub use scheduler::TaskScheduler;
pub use store::TaskStore;
pub use tasks::{RunRecord, RunStatus, Schedule, ScheduledTask, TaskUpdate, TriggerKind};
