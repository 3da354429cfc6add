//! # Muster Runtime
//!
//! The coordinating control loop: one single-threaded loop owns every
//! agent's timers, queue, and state machine, and hands execution to a
//! small bounded worker pool. The loop itself never blocks on I/O or on
//! an executor.
//!
//! ## Architecture
//! ```text
//! tick (1s)
//!   ├── heartbeats → Low  Heartbeat events
//!   ├── due tasks  → Normal TaskDue events
//!   ├── triggers   → High ExternalTrigger events (channel + CLI markers)
//!   ├── Idle agents: pop best event → Dispatcher (4 shared slots)
//!   └── Busy agents: harvest finished executions → Idle
//! ```
//!
//! Data flows one direction per tick: timers/triggers → queue →
//! dispatcher → executor → run record. Liveness snapshots make `active`
//! agents survive a restart inside a 10-minute window.

pub mod agent;
pub mod dispatch;
pub mod queue;
pub mod runtime;
pub mod snapshot;

pub use agent::{AgentState, InFlight};
pub use dispatch::{Dispatcher, ExecutionHandle};
pub use queue::{EnqueueResult, EventKind, PendingEvent, PriorityEventQueue, Priority};
pub use runtime::{Runtime, RuntimeHandle};
pub use snapshot::{AgentSnapshot, RuntimeSnapshot};
