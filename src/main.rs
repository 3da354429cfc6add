//! # Muster — agent runtime and task scheduler
//!
//! Administrative CLI plus the runtime daemon. Task commands operate on
//! the task store directly; the daemon is reached through marker files,
//! so `trigger` fires on the next tick of a running daemon.
//!
//! Usage:
//!   muster daemon run                        # Start the control loop (foreground)
//!   muster daemon stop                       # Ask a running daemon to exit
//!   muster agent start <id>                  # Activate an agent
//!   muster task create <agent> <task> --interval 300
//!   muster task trigger <agent> <task>       # Fire regardless of schedule
//!   muster task runs <agent> <task>          # Recent run history

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use muster_core::traits::{
    ExecutionOutcome, ExecutionRequest, Executor, NullCredentialStore, NullSkillMatcher,
    NullStateStore,
};
use muster_core::MusterConfig;
use muster_runtime::Runtime;
use muster_scheduler::{
    ContextResolver, Schedule, ScheduledTask, TaskScheduler, TaskStore, TaskUpdate, TriggerKind,
};

#[derive(Parser)]
#[command(name = "muster", version, about = "Agent runtime and task scheduler")]
struct Cli {
    /// Config file (default ~/.muster/config.toml)
    #[arg(long)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runtime daemon control
    Daemon {
        #[command(subcommand)]
        command: DaemonCommands,
    },
    /// Agent lifecycle
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Scheduled task management
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
}

#[derive(Subcommand)]
enum DaemonCommands {
    /// Run the control loop in the foreground
    Run,
    /// Ask a running daemon to shut down
    Stop,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Mark an agent active (picked up by the daemon on its next tick)
    Start { agent_id: String },
    /// Mark an agent inactive
    Stop { agent_id: String },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List tasks, optionally for one agent
    List {
        #[arg(long)]
        agent: Option<String>,
    },
    /// Show one task
    Get { agent_id: String, task_id: String },
    /// Create a task (exactly one of --interval/--cron/--at/--event-only)
    Create {
        agent_id: String,
        task_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "")]
        description: String,
        /// Fire every N seconds
        #[arg(long)]
        interval: Option<u64>,
        /// Five- or six-field cron expression
        #[arg(long)]
        cron: Option<String>,
        /// Fire once at an RFC 3339 timestamp
        #[arg(long)]
        at: Option<String>,
        /// No timer; fires only on trigger
        #[arg(long)]
        event_only: bool,
        /// Explicit skill binding (default: matched at fire time)
        #[arg(long)]
        skill: Option<String>,
        #[arg(long, default_value = "")]
        instructions: String,
        /// Task context as a JSON object (may contain placeholders)
        #[arg(long)]
        context_json: Option<String>,
    },
    /// Patch task config fields
    Update {
        agent_id: String,
        task_id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        cron: Option<String>,
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        event_only: bool,
        #[arg(long)]
        skill: Option<String>,
        #[arg(long)]
        context_json: Option<String>,
    },
    /// Replace the instruction text only
    EditInstructions {
        agent_id: String,
        task_id: String,
        instructions: String,
    },
    /// Delete a task and its entire history
    Delete { agent_id: String, task_id: String },
    Enable { agent_id: String, task_id: String },
    Disable { agent_id: String, task_id: String },
    /// Fire a task immediately, regardless of schedule
    Trigger { agent_id: String, task_id: String },
    /// Recent run history, newest first
    Runs {
        agent_id: String,
        task_id: String,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "muster=debug" } else { "muster=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => MusterConfig::load_from(std::path::Path::new(path))?,
        None => MusterConfig::load()?,
    };
    let data_dir = PathBuf::from(shellexpand::tilde(&config.store.data_dir).to_string());

    match cli.command {
        Commands::Daemon { command } => match command {
            DaemonCommands::Run => run_daemon(&config, &data_dir).await?,
            DaemonCommands::Stop => {
                Runtime::request_stop(&data_dir)?;
                println!("stop requested");
            }
        },
        Commands::Agent { command } => match command {
            AgentCommands::Start { agent_id } => {
                Runtime::request_agent_start(&data_dir, &agent_id)?;
                println!("start requested for '{agent_id}'");
            }
            AgentCommands::Stop { agent_id } => {
                Runtime::request_agent_stop(&data_dir, &agent_id)?;
                println!("stop requested for '{agent_id}'");
            }
        },
        Commands::Task { command } => {
            let scheduler = build_scheduler(&config, &data_dir);
            run_task_command(&scheduler, command)?;
        }
    }
    Ok(())
}

fn build_scheduler(config: &MusterConfig, data_dir: &std::path::Path) -> TaskScheduler {
    // CLI task commands never execute anything; the daemon wires in the
    // real executor.
    TaskScheduler::new(
        TaskStore::new(data_dir, config.store.run_history_limit),
        ContextResolver::new(
            Arc::new(NullCredentialStore),
            Arc::new(NullStateStore),
            data_dir.to_path_buf(),
        ),
        Arc::new(muster_core::traits::NullExecutor),
        Arc::new(NullSkillMatcher),
    )
}

async fn run_daemon(config: &MusterConfig, data_dir: &std::path::Path) -> Result<()> {
    let executor: Arc<dyn Executor> = if config.executor.command.is_empty() {
        tracing::warn!("no [executor] command configured, using the logging stub");
        Arc::new(LoggingExecutor)
    } else {
        Arc::new(CommandExecutor {
            command: config.executor.command.clone(),
        })
    };

    let scheduler = Arc::new(TaskScheduler::new(
        TaskStore::new(data_dir, config.store.run_history_limit),
        ContextResolver::new(
            Arc::new(NullCredentialStore),
            Arc::new(NullStateStore),
            data_dir.to_path_buf(),
        ),
        executor.clone(),
        Arc::new(NullSkillMatcher),
    ));

    let (runtime, handle) = Runtime::new(config.runtime.clone(), scheduler, executor);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received, shutting down");
            handle.shutdown();
        }
    });

    runtime.run().await?;
    Ok(())
}

fn run_task_command(scheduler: &TaskScheduler, command: TaskCommands) -> Result<()> {
    match command {
        TaskCommands::List { agent } => {
            let tasks = scheduler.list_tasks(agent.as_deref())?;
            if tasks.is_empty() {
                println!("no tasks");
            }
            let now = chrono::Utc::now();
            for task in tasks {
                let next = scheduler
                    .next_run_at(&task, now)
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{}/{}  enabled={}  runs={}  next={}",
                    task.agent_id, task.task_id, task.enabled, task.run_count, next
                );
            }
        }
        TaskCommands::Get { agent_id, task_id } => {
            let task = scheduler.get_task(&agent_id, &task_id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        TaskCommands::Create {
            agent_id,
            task_id,
            name,
            description,
            interval,
            cron,
            at,
            event_only,
            skill,
            instructions,
            context_json,
        } => {
            let schedule = parse_schedule(interval, cron, at, event_only)?
                .ok_or_else(|| anyhow::anyhow!("one of --interval/--cron/--at/--event-only is required"))?;
            let mut task = ScheduledTask::new(
                &agent_id,
                &task_id,
                name.as_deref().unwrap_or(&task_id),
                schedule,
            );
            task.description = description;
            task.skill_id = skill;
            task.instructions = instructions;
            if let Some(json) = context_json {
                task.context = parse_context(&json)?;
            }
            let task = scheduler.create_task(task)?;
            println!("created {}/{}", task.agent_id, task.task_id);
        }
        TaskCommands::Update {
            agent_id,
            task_id,
            name,
            description,
            interval,
            cron,
            at,
            event_only,
            skill,
            context_json,
        } => {
            let patch = TaskUpdate {
                name,
                description,
                schedule: parse_schedule(interval, cron, at, event_only)?,
                skill_id: skill.map(Some),
                enabled: None,
                context: context_json.as_deref().map(parse_context).transpose()?,
            };
            let task = scheduler.update_task(&agent_id, &task_id, &patch)?;
            println!("updated {}/{}", task.agent_id, task.task_id);
        }
        TaskCommands::EditInstructions {
            agent_id,
            task_id,
            instructions,
        } => {
            scheduler.update_instructions(&agent_id, &task_id, &instructions)?;
            println!("updated instructions for {agent_id}/{task_id}");
        }
        TaskCommands::Delete { agent_id, task_id } => {
            scheduler.delete_task(&agent_id, &task_id)?;
            println!("deleted {agent_id}/{task_id}");
        }
        TaskCommands::Enable { agent_id, task_id } => {
            scheduler.enable_task(&agent_id, &task_id)?;
            println!("enabled {agent_id}/{task_id}");
        }
        TaskCommands::Disable { agent_id, task_id } => {
            scheduler.disable_task(&agent_id, &task_id)?;
            println!("disabled {agent_id}/{task_id}");
        }
        TaskCommands::Trigger { agent_id, task_id } => {
            // Leaves a marker for the daemon; fires on its next tick,
            // behind anything already in flight for the agent.
            scheduler.get_task(&agent_id, &task_id)?;
            scheduler
                .store()
                .request_trigger(&agent_id, &task_id, TriggerKind::Manual)?;
            println!("trigger requested for {agent_id}/{task_id}");
        }
        TaskCommands::Runs {
            agent_id,
            task_id,
            limit,
        } => {
            let runs = scheduler.get_run_history(&agent_id, &task_id, limit)?;
            if runs.is_empty() {
                println!("no runs recorded");
            }
            for run in runs {
                println!(
                    "{}  {:?}  {:?}  {}ms  {}",
                    run.started_at.to_rfc3339(),
                    run.trigger,
                    run.status,
                    run.duration_ms,
                    run.error.unwrap_or_default()
                );
            }
        }
    }
    Ok(())
}

fn parse_schedule(
    interval: Option<u64>,
    cron: Option<String>,
    at: Option<String>,
    event_only: bool,
) -> Result<Option<Schedule>> {
    let mut choices = Vec::new();
    if let Some(every_secs) = interval {
        choices.push(Schedule::Interval { every_secs });
    }
    if let Some(expression) = cron {
        choices.push(Schedule::Cron { expression });
    }
    if let Some(at) = at {
        let at = chrono::DateTime::parse_from_rfc3339(&at)
            .map_err(|e| anyhow::anyhow!("invalid --at timestamp: {e}"))?
            .with_timezone(&chrono::Utc);
        choices.push(Schedule::Once { at });
    }
    if event_only {
        choices.push(Schedule::EventOnly);
    }
    if choices.len() > 1 {
        anyhow::bail!("--interval, --cron, --at, and --event-only are mutually exclusive");
    }
    Ok(choices.pop())
}

fn parse_context(json: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| anyhow::anyhow!("invalid --context-json: {e}"))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => anyhow::bail!("--context-json must be a JSON object"),
    }
}

/// Stub executor for daemons with no [executor] command: logs the request
/// and reports success.
struct LoggingExecutor;

#[async_trait]
impl Executor for LoggingExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> muster_core::Result<ExecutionOutcome> {
        tracing::info!(
            "🤖 [{}] {:?} task={:?}: {}",
            request.agent_id,
            request.kind,
            request.task_id,
            request.instructions
        );
        Ok(ExecutionOutcome::completed("logged"))
    }
}

/// Shells out to the configured command with the request as JSON on stdin.
/// Stdout is decoded as an [`ExecutionOutcome`]; anything else becomes the
/// raw output, with the exit status deciding success.
struct CommandExecutor {
    command: String,
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> muster_core::Result<ExecutionOutcome> {
        use std::process::Stdio;
        use tokio::io::AsyncWriteExt;

        let input = serde_json::to_vec(&request)
            .map_err(|e| muster_core::MusterError::Executor(format!("encode request: {e}")))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                muster_core::MusterError::Executor(format!("spawn '{}': {e}", self.command))
            })?;

        // Written concurrently with the stdout drain below: a child that
        // fills its stdout pipe before reading stdin would otherwise
        // deadlock this job and park the agent Busy.
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                let _ = stdin.write_all(&input).await;
            });
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| muster_core::MusterError::Executor(format!("wait: {e}")))?;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();

        if let Ok(outcome) = serde_json::from_str::<ExecutionOutcome>(&stdout) {
            return Ok(outcome);
        }
        if output.status.success() {
            Ok(ExecutionOutcome::completed(stdout))
        } else {
            Ok(ExecutionOutcome::error(format!(
                "exit {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use muster_core::traits::{ExecutionKind, ExecutionStatus};
    use std::time::Duration;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            agent_id: "a1".into(),
            kind: ExecutionKind::Task,
            task_id: Some("t1".into()),
            instructions: "x".repeat(4096),
            context: serde_json::Value::Null,
            skill_content: None,
            started_at: chrono::Utc::now(),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_survives_chatty_child() {
        // Child fills its stdout pipe well past the kernel buffer before it
        // ever reads stdin; the executor must drain it rather than block on
        // the stdin write.
        let executor = CommandExecutor {
            command: "head -c 262144 /dev/zero | tr '\\0' x; cat >/dev/null; echo ok".into(),
        };
        let outcome = tokio::time::timeout(
            Duration::from_secs(10),
            executor.execute(request()),
        )
        .await
        .expect("command executor never finished")
        .unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Completed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_executor_reports_nonzero_exit() {
        let executor = CommandExecutor {
            command: "exit 3".into(),
        };
        let outcome = executor.execute(request()).await.unwrap();
        assert_eq!(outcome.status, ExecutionStatus::Error);
    }
}
