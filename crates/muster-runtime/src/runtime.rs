//! The control loop — one single-threaded coordinator that owns every
//! agent's timers, queue, and state machine.
//!
//! Once per tick it advances heartbeats, collects due tasks and triggers,
//! hands the best pending event of each idle agent to the dispatcher, and
//! harvests finished executions. Only the execution step runs on the
//! worker pool; the loop itself never blocks on I/O or an executor, and
//! nothing harvested is ever re-raised into it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

use muster_core::config::RuntimeConfig;
use muster_core::error::Result;
use muster_core::traits::{ExecutionKind, ExecutionRequest, ExecutionStatus, Executor};
use muster_scheduler::{RunStatus, TaskScheduler, TriggerKind};

use crate::agent::{AgentState, InFlight};
use crate::dispatch::Dispatcher;
use crate::queue::{EnqueueResult, EventKind, PendingEvent, Priority};
use crate::snapshot::{AgentSnapshot, RuntimeSnapshot};

const SNAPSHOT_FILE: &str = "runtime.json";
const STOP_MARKER: &str = "daemon.stop";
const CONTROL_DIR: &str = "control";

/// Instructions handed to the executor for heartbeat wake-ups.
const HEARTBEAT_INSTRUCTIONS: &str =
    "Periodic heartbeat: review pending work and act if anything needs attention.";

/// In-process commands from [`RuntimeHandle`].
enum Command {
    Trigger {
        agent_id: String,
        task_id: String,
        priority: Priority,
    },
    StartAgent {
        agent_id: String,
        heartbeat_secs: Option<u64>,
    },
    StopAgent {
        agent_id: String,
    },
    Status {
        reply: oneshot::Sender<Vec<AgentStatus>>,
    },
    Shutdown,
}

/// Cross-process control marker left under `<data_dir>/control/` by the CLI.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ControlMarker {
    StartAgent { agent_id: String },
    StopAgent { agent_id: String },
}

/// Point-in-time view of one agent, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub agent_id: String,
    pub active: bool,
    pub busy: bool,
    pub queued_events: usize,
    pub last_heartbeat_emitted_at: Option<DateTime<Utc>>,
}

/// Clonable intake path: external triggers and agent lifecycle commands
/// enter the loop through here, never by touching its state directly.
#[derive(Clone)]
pub struct RuntimeHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl RuntimeHandle {
    /// Queue an external trigger for a task. It fires behind any execution
    /// already in flight for that agent.
    pub fn trigger(&self, agent_id: &str, task_id: &str, priority: Priority) {
        let _ = self.tx.send(Command::Trigger {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            priority,
        });
    }

    pub fn start_agent(&self, agent_id: &str, heartbeat_secs: Option<u64>) {
        let _ = self.tx.send(Command::StartAgent {
            agent_id: agent_id.to_string(),
            heartbeat_secs,
        });
    }

    pub fn stop_agent(&self, agent_id: &str) {
        let _ = self.tx.send(Command::StopAgent {
            agent_id: agent_id.to_string(),
        });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown);
    }

    pub async fn status(&self) -> Option<Vec<AgentStatus>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(Command::Status { reply }).ok()?;
        rx.await.ok()
    }
}

/// The runtime: control loop + agent states + dispatcher.
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Arc<TaskScheduler>,
    executor: Arc<dyn Executor>,
    dispatcher: Dispatcher,
    agents: HashMap<String, AgentState>,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot_path: PathBuf,
    last_snapshot_at: Option<DateTime<Utc>>,
    shutdown: bool,
}

impl Runtime {
    pub fn new(
        config: RuntimeConfig,
        scheduler: Arc<TaskScheduler>,
        executor: Arc<dyn Executor>,
    ) -> (Self, RuntimeHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let job_timeout = match config.executor_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        let snapshot_path = scheduler.data_dir().join(SNAPSHOT_FILE);
        let dispatcher = Dispatcher::new(config.worker_slots.max(1), job_timeout);
        let runtime = Self {
            config,
            scheduler,
            executor,
            dispatcher,
            agents: HashMap::new(),
            commands: rx,
            snapshot_path,
            last_snapshot_at: None,
            shutdown: false,
        };
        (runtime, RuntimeHandle { tx })
    }

    /// Restore liveness from the last snapshot. Agents marked active in a
    /// recent-enough snapshot come back active; everyone else starts
    /// inactive and must be explicitly started.
    pub fn restore(&mut self, now: DateTime<Utc>) -> Result<()> {
        let Some(snapshot) = RuntimeSnapshot::load(&self.snapshot_path)? else {
            return Ok(());
        };
        let restorable = snapshot.within_window(now, self.config.restore_window_secs);
        for saved in snapshot.agents {
            let agent = self.agent_entry(&saved.agent_id);
            agent.heartbeat_secs = saved.heartbeat_secs;
            agent.last_heartbeat_emitted_at = saved.last_heartbeat_emitted_at;
            if saved.active && restorable {
                agent.active = true;
                tracing::info!("🔄 agent restored active: {}", saved.agent_id);
            }
        }
        if !restorable {
            tracing::info!(
                "snapshot older than {}s, all agents start inactive",
                self.config.restore_window_secs
            );
        }
        Ok(())
    }

    /// Run until shutdown. Fixed cadence; the cadence itself is a tunable,
    /// not load-bearing.
    pub async fn run(mut self) -> Result<()> {
        self.restore(Utc::now())?;
        tracing::info!(
            "⏰ runtime started (tick {}s, {} worker slots)",
            self.config.tick_secs,
            self.dispatcher.slots()
        );
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.tick(Utc::now());
            if self.shutdown {
                break;
            }
        }
        self.write_snapshot();
        tracing::info!("runtime stopped");
        Ok(())
    }

    /// One evaluation pass. Public so tests can drive time explicitly.
    pub fn tick(&mut self, now: DateTime<Utc>) {
        self.drain_commands();
        self.scan_control_markers();
        self.sync_store_agents();
        self.emit_heartbeats(now);
        self.collect_due_work(now);
        self.dispatch_idle_agents(now);
        self.harvest_busy_agents();
        self.maybe_snapshot(now);
    }

    pub fn agent_status(&self) -> Vec<AgentStatus> {
        let mut statuses: Vec<_> = self
            .agents
            .values()
            .map(|agent| AgentStatus {
                agent_id: agent.agent_id.clone(),
                active: agent.active,
                busy: agent.is_busy(),
                queued_events: agent.queue.len(),
                last_heartbeat_emitted_at: agent.last_heartbeat_emitted_at,
            })
            .collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    // ─── Tick phases ────────────────────────────────────────────

    fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Trigger {
                    agent_id,
                    task_id,
                    priority,
                } => {
                    let event = PendingEvent::new(
                        priority,
                        EventKind::ExternalTrigger {
                            task_id,
                            trigger: TriggerKind::Event,
                        },
                    );
                    self.enqueue(&agent_id, event);
                }
                Command::StartAgent {
                    agent_id,
                    heartbeat_secs,
                } => {
                    let default_heartbeat = self.config.heartbeat_secs;
                    let agent = self.agent_entry(&agent_id);
                    if let Some(secs) = heartbeat_secs {
                        agent.heartbeat_secs = secs;
                    } else if agent.heartbeat_secs == 0 {
                        agent.heartbeat_secs = default_heartbeat;
                    }
                    agent.active = true;
                    tracing::info!("▶️ agent started: {agent_id}");
                }
                Command::StopAgent { agent_id } => {
                    if let Some(agent) = self.agents.get_mut(&agent_id) {
                        agent.active = false;
                        tracing::info!("⏸️ agent stopped: {agent_id}");
                    }
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.agent_status());
                }
                Command::Shutdown => self.shutdown = true,
            }
        }
    }

    /// Pick up control and stop markers left by CLI processes.
    fn scan_control_markers(&mut self) {
        let data_dir = self.scheduler.data_dir().to_path_buf();
        if data_dir.join(STOP_MARKER).exists() {
            let _ = std::fs::remove_file(data_dir.join(STOP_MARKER));
            tracing::info!("stop marker found, shutting down");
            self.shutdown = true;
        }

        let control_dir = data_dir.join(CONTROL_DIR);
        let Ok(entries) = std::fs::read_dir(&control_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let marker = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| serde_json::from_str::<ControlMarker>(&content).ok());
            let _ = std::fs::remove_file(&path);
            match marker {
                Some(ControlMarker::StartAgent { agent_id }) => {
                    let default_heartbeat = self.config.heartbeat_secs;
                    let agent = self.agent_entry(&agent_id);
                    if agent.heartbeat_secs == 0 {
                        agent.heartbeat_secs = default_heartbeat;
                    }
                    agent.active = true;
                    tracing::info!("▶️ agent started via CLI: {agent_id}");
                }
                Some(ControlMarker::StopAgent { agent_id }) => {
                    if let Some(agent) = self.agents.get_mut(&agent_id) {
                        agent.active = false;
                        tracing::info!("⏸️ agent stopped via CLI: {agent_id}");
                    }
                }
                None => tracing::warn!("dropping unreadable control marker: {path:?}"),
            }
        }
    }

    /// Agents that exist on disk but not in memory appear inactive.
    fn sync_store_agents(&mut self) {
        let Ok(agent_ids) = self.scheduler.store().list_agents() else {
            return;
        };
        for agent_id in agent_ids {
            self.agent_entry(&agent_id);
        }
    }

    fn emit_heartbeats(&mut self, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .agents
            .values()
            .filter(|agent| agent.heartbeat_due(now))
            .map(|agent| agent.agent_id.clone())
            .collect();
        for agent_id in due {
            let event = PendingEvent::new(Priority::Low, EventKind::Heartbeat);
            self.enqueue(&agent_id, event);
            // The boundary advances even when the queue declined the event,
            // otherwise a full queue turns heartbeats into a flood.
            if let Some(agent) = self.agents.get_mut(&agent_id) {
                agent.advance_heartbeat(now);
            }
        }
    }

    fn collect_due_work(&mut self, now: DateTime<Utc>) {
        let active: Vec<String> = self
            .agents
            .values()
            .filter(|agent| agent.active)
            .map(|agent| agent.agent_id.clone())
            .collect();

        for agent_id in active {
            // CLI trigger markers → High-priority external triggers.
            match self.scheduler.store().take_triggers(&agent_id) {
                Ok(markers) => {
                    for marker in markers {
                        let event = PendingEvent::new(
                            Priority::High,
                            EventKind::ExternalTrigger {
                                task_id: marker.task_id,
                                trigger: marker.trigger,
                            },
                        );
                        self.enqueue(&agent_id, event);
                    }
                }
                Err(e) => tracing::warn!("trigger scan failed for {agent_id}: {e}"),
            }

            // Due tasks → Normal-priority events, deduplicated against the
            // queue and the in-flight execution (a task stays due until its
            // fire updates last_run_at).
            let due = match self.scheduler.due_tasks(&agent_id, now) {
                Ok(due) => due,
                Err(e) => {
                    tracing::warn!("due-task scan failed for {agent_id}: {e}");
                    continue;
                }
            };
            for task in due {
                let agent = match self.agents.get(&agent_id) {
                    Some(agent) => agent,
                    None => continue,
                };
                if agent.queue.contains_task(&task.task_id)
                    || agent.in_flight_task() == Some(task.task_id.as_str())
                {
                    continue;
                }
                let event = PendingEvent::new(
                    Priority::Normal,
                    EventKind::TaskDue {
                        task_id: task.task_id,
                    },
                );
                self.enqueue(&agent_id, event);
            }
        }
    }

    fn dispatch_idle_agents(&mut self, now: DateTime<Utc>) {
        let idle: Vec<String> = self
            .agents
            .values()
            .filter(|agent| agent.active && !agent.is_busy() && !agent.queue.is_empty())
            .map(|agent| agent.agent_id.clone())
            .collect();

        for agent_id in idle {
            if self.dispatcher.available_slots() == 0 {
                // Pool saturated: everything stays queued for the next tick.
                break;
            }
            let Some(event) = self
                .agents
                .get_mut(&agent_id)
                .and_then(|agent| agent.queue.pop())
            else {
                continue;
            };
            let job = build_job(
                &self.scheduler,
                &self.executor,
                &agent_id,
                &event.kind,
                now,
            );
            let submitted = self.dispatcher.try_submit(job);
            let Some(agent) = self.agents.get_mut(&agent_id) else {
                continue;
            };
            match submitted {
                Some(handle) => {
                    tracing::debug!("📥 dispatched {:?} for {agent_id}", event.kind);
                    agent.begin(InFlight {
                        event,
                        started_at: now,
                        handle,
                    });
                }
                None => agent.queue.restore(event),
            }
        }
    }

    fn harvest_busy_agents(&mut self) {
        for agent in self.agents.values_mut() {
            let Some((event, result)) = agent.try_harvest() else {
                continue;
            };
            // Success and failure both end here; errors are recorded by the
            // fire path and only logged at this level.
            match result {
                Ok(outcome) => match outcome.status {
                    ExecutionStatus::Completed => {
                        tracing::debug!("✅ {}: {:?} completed", agent.agent_id, event.kind)
                    }
                    ExecutionStatus::Error => tracing::warn!(
                        "⚠️ {}: {:?} failed: {}",
                        agent.agent_id,
                        event.kind,
                        outcome.error.unwrap_or_default()
                    ),
                },
                Err(e) => {
                    tracing::warn!("⚠️ {}: {:?} errored: {e}", agent.agent_id, event.kind)
                }
            }
        }
    }

    fn maybe_snapshot(&mut self, now: DateTime<Utc>) {
        let due = match self.last_snapshot_at {
            None => true,
            Some(last) => (now - last).num_seconds() >= self.config.snapshot_secs as i64,
        };
        if due {
            self.write_snapshot();
            self.last_snapshot_at = Some(now);
        }
    }

    fn write_snapshot(&self) {
        let agents = self
            .agents
            .values()
            .map(|agent| AgentSnapshot {
                agent_id: agent.agent_id.clone(),
                active: agent.active,
                heartbeat_secs: agent.heartbeat_secs,
                last_heartbeat_emitted_at: agent.last_heartbeat_emitted_at,
            })
            .collect();
        if let Err(e) = RuntimeSnapshot::new(agents).save(&self.snapshot_path) {
            tracing::warn!("⚠️ failed to write runtime snapshot: {e}");
        }
    }

    // ─── Helpers ────────────────────────────────────────────────

    fn agent_entry(&mut self, agent_id: &str) -> &mut AgentState {
        let heartbeat_secs = self.config.heartbeat_secs;
        let queue_capacity = self.config.queue_capacity;
        self.agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id, heartbeat_secs, queue_capacity))
    }

    fn enqueue(&mut self, agent_id: &str, event: PendingEvent) {
        let kind = event.kind.clone();
        let agent = self.agent_entry(agent_id);
        match agent.queue.push(event) {
            EnqueueResult::Queued => {}
            EnqueueResult::Evicted(victim) => {
                tracing::warn!(
                    "queue full for {agent_id}: evicted {:?} to admit {kind:?}",
                    victim.kind
                );
            }
            EnqueueResult::Rejected(_) => {
                tracing::warn!("queue full for {agent_id}: rejected {kind:?}");
            }
        }
    }
}

/// Build the dispatcher job for one event. Task-backed events run the
/// scheduler's full fire path (which persists the run record itself);
/// heartbeats go straight to the executor.
fn build_job(
    scheduler: &Arc<TaskScheduler>,
    executor: &Arc<dyn Executor>,
    agent_id: &str,
    kind: &EventKind,
    now: DateTime<Utc>,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<muster_core::traits::ExecutionOutcome>> + Send>,
> {
    use muster_core::traits::ExecutionOutcome;

    match kind {
        EventKind::Heartbeat => {
            let executor = executor.clone();
            let request = ExecutionRequest {
                agent_id: agent_id.to_string(),
                kind: ExecutionKind::Heartbeat,
                task_id: None,
                instructions: HEARTBEAT_INSTRUCTIONS.to_string(),
                context: serde_json::Value::Null,
                skill_content: None,
                started_at: now,
            };
            Box::pin(async move { executor.execute(request).await })
        }
        EventKind::TaskDue { task_id } => fire_job(
            scheduler.clone(),
            agent_id.to_string(),
            task_id.clone(),
            TriggerKind::Scheduled,
        ),
        EventKind::ExternalTrigger { task_id, trigger } => fire_job(
            scheduler.clone(),
            agent_id.to_string(),
            task_id.clone(),
            *trigger,
        ),
    }
}

fn fire_job(
    scheduler: Arc<TaskScheduler>,
    agent_id: String,
    task_id: String,
    trigger: TriggerKind,
) -> std::pin::Pin<
    Box<dyn std::future::Future<Output = Result<muster_core::traits::ExecutionOutcome>> + Send>,
> {
    use muster_core::traits::ExecutionOutcome;

    Box::pin(async move {
        let record = scheduler.fire_task(&agent_id, &task_id, trigger).await?;
        Ok(match record.status {
            RunStatus::Completed => ExecutionOutcome::completed(""),
            RunStatus::Error => {
                ExecutionOutcome::error(record.error.unwrap_or_else(|| "task failed".into()))
            }
        })
    })
}

/// CLI-side marker writers. These are the only way another process talks
/// to a running daemon.
impl Runtime {
    pub fn request_stop(data_dir: &std::path::Path) -> Result<()> {
        std::fs::create_dir_all(data_dir)?;
        std::fs::write(data_dir.join(STOP_MARKER), b"stop")?;
        Ok(())
    }

    pub fn request_agent_start(data_dir: &std::path::Path, agent_id: &str) -> Result<()> {
        write_control_marker(data_dir, &ControlMarker::StartAgent {
            agent_id: agent_id.to_string(),
        })
    }

    pub fn request_agent_stop(data_dir: &std::path::Path, agent_id: &str) -> Result<()> {
        write_control_marker(data_dir, &ControlMarker::StopAgent {
            agent_id: agent_id.to_string(),
        })
    }
}

fn write_control_marker(data_dir: &std::path::Path, marker: &ControlMarker) -> Result<()> {
    let dir = data_dir.join(CONTROL_DIR);
    std::fs::create_dir_all(&dir)?;
    let json = serde_json::to_string_pretty(marker)
        .map_err(|e| muster_core::MusterError::Store(format!("serialize control marker: {e}")))?;
    let path = dir.join(format!("{}.json", uuid::Uuid::new_v4()));
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)?;
    std::fs::rename(&tmp, &path)?;
    Ok(())
}
