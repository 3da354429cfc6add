//! Task lifecycle + firing — the orchestration layer over store, calc,
//! and resolver.
//!
//! Validation happens here at the API boundary; nothing malformed reaches
//! the control loop. Firing never disables a failing task: a resolution or
//! executor failure becomes an `error` run record and the task retries at
//! its next natural fire time. Concurrency is *not* enforced here — the
//! runtime owns the one-in-flight-per-agent invariant.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use muster_core::error::{MusterError, Result};
use muster_core::traits::{
    ExecutionKind, ExecutionRequest, ExecutionStatus, Executor, SkillMatcher,
};

use crate::calc;
use crate::resolver::ContextResolver;
use crate::store::TaskStore;
use crate::tasks::{RunRecord, RunStatus, Schedule, ScheduledTask, TaskUpdate, TriggerKind};

pub struct TaskScheduler {
    store: TaskStore,
    resolver: ContextResolver,
    executor: Arc<dyn Executor>,
    skills: Arc<dyn SkillMatcher>,
}

impl TaskScheduler {
    pub fn new(
        store: TaskStore,
        resolver: ContextResolver,
        executor: Arc<dyn Executor>,
        skills: Arc<dyn SkillMatcher>,
    ) -> Self {
        Self {
            store,
            resolver,
            executor,
            skills,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn data_dir(&self) -> &Path {
        self.store.data_dir()
    }

    // ─── Lifecycle ──────────────────────────────────────────────

    /// Create a task. Duplicate ids and malformed schedules are rejected
    /// before anything touches disk.
    pub fn create_task(&self, task: ScheduledTask) -> Result<ScheduledTask> {
        validate_task(&task)?;
        self.store.create(&task)?;
        Ok(task)
    }

    pub fn get_task(&self, agent_id: &str, task_id: &str) -> Result<ScheduledTask> {
        self.owned_task(agent_id, task_id)
    }

    /// Partial config update. Instructions are excluded — see
    /// [`Self::update_instructions`].
    pub fn update_task(
        &self,
        agent_id: &str,
        task_id: &str,
        patch: &TaskUpdate,
    ) -> Result<ScheduledTask> {
        let task = self.owned_task(agent_id, task_id)?;
        let merged = task.merged(patch);
        validate_task(&merged)?;
        self.store.save(&merged)?;
        Ok(merged)
    }

    /// Replace the instruction text only. Kept separate from config updates
    /// so a large content edit cannot race a concurrent field patch.
    pub fn update_instructions(
        &self,
        agent_id: &str,
        task_id: &str,
        instructions: &str,
    ) -> Result<ScheduledTask> {
        let mut task = self.owned_task(agent_id, task_id)?;
        task.instructions = instructions.to_string();
        self.store.save(&task)?;
        Ok(task)
    }

    pub fn delete_task(&self, agent_id: &str, task_id: &str) -> Result<()> {
        self.owned_task(agent_id, task_id)?;
        self.store.delete(agent_id, task_id)
    }

    pub fn enable_task(&self, agent_id: &str, task_id: &str) -> Result<ScheduledTask> {
        self.set_enabled(agent_id, task_id, true)
    }

    pub fn disable_task(&self, agent_id: &str, task_id: &str) -> Result<ScheduledTask> {
        self.set_enabled(agent_id, task_id, false)
    }

    fn set_enabled(&self, agent_id: &str, task_id: &str, enabled: bool) -> Result<ScheduledTask> {
        let mut task = self.owned_task(agent_id, task_id)?;
        task.enabled = enabled;
        self.store.save(&task)?;
        tracing::info!(
            "task {agent_id}/{task_id} {}",
            if enabled { "enabled" } else { "disabled" }
        );
        Ok(task)
    }

    /// List tasks, optionally filtered to one owner.
    pub fn list_tasks(&self, owner: Option<&str>) -> Result<Vec<ScheduledTask>> {
        match owner {
            Some(agent_id) => self.store.list(agent_id),
            None => {
                let mut all = Vec::new();
                for agent_id in self.store.list_agents()? {
                    all.extend(self.store.list(&agent_id)?);
                }
                Ok(all)
            }
        }
    }

    pub fn get_run_history(
        &self,
        agent_id: &str,
        task_id: &str,
        limit: usize,
    ) -> Result<Vec<RunRecord>> {
        self.owned_task(agent_id, task_id)?;
        self.store.run_history(agent_id, task_id, limit)
    }

    // ─── Scheduling queries ─────────────────────────────────────

    /// When a task will next fire on its own. `None` = never (disabled,
    /// event-only, consumed one-shot, or malformed cron).
    pub fn next_run_at(&self, task: &ScheduledTask, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !task.enabled {
            return None;
        }
        // A one-shot is consumed by its natural fire (which disables it),
        // never by a manual trigger — so while it is still enabled, the
        // fixed timestamp stands regardless of manual runs.
        let last_run = match task.schedule {
            Schedule::Once { .. } => None,
            _ => task.last_run_at,
        };
        calc::next_fire(&task.schedule, last_run, now)
    }

    /// Enabled tasks whose next fire time has arrived.
    pub fn due_tasks(&self, agent_id: &str, now: DateTime<Utc>) -> Result<Vec<ScheduledTask>> {
        let due = self
            .store
            .list(agent_id)?
            .into_iter()
            .filter(|task| matches!(self.next_run_at(task, now), Some(at) if at <= now))
            .collect();
        Ok(due)
    }

    // ─── Firing ─────────────────────────────────────────────────

    /// Fire a task immediately, regardless of schedule. Produces a run
    /// record like any other fire. The one-in-flight-per-agent invariant is
    /// the runtime's to enforce; daemon-external callers should use the
    /// store's trigger marker instead of calling this directly.
    pub async fn trigger_task(&self, agent_id: &str, task_id: &str) -> Result<RunRecord> {
        self.fire_task(agent_id, task_id, TriggerKind::Manual).await
    }

    /// The shared fire path: resolve skill → resolve context → execute →
    /// record → advance schedule state.
    pub async fn fire_task(
        &self,
        agent_id: &str,
        task_id: &str,
        trigger: TriggerKind,
    ) -> Result<RunRecord> {
        let task = self.owned_task(agent_id, task_id)?;
        let started_at = Utc::now();

        let attempt = self.run_once(&task, trigger, started_at).await;
        let record = match attempt {
            Ok(record) => record,
            // Resolution and executor failures downgrade to an error
            // record; the task stays scheduled for its next natural fire.
            Err(e) if e.is_recorded_at_fire() => {
                tracing::warn!("task {agent_id}/{task_id} failed: {e}");
                RunRecord::new(task_id, started_at, trigger, RunStatus::Error, Some(e.to_string()))
            }
            Err(e) => return Err(e),
        };

        self.store.append_run(agent_id, &record)?;

        let mut next = task.clone();
        next.last_run_at = Some(started_at);
        next.run_count += 1;
        // Only the natural scheduled fire consumes a one-shot.
        if matches!(next.schedule, Schedule::Once { .. }) && trigger == TriggerKind::Scheduled {
            next.enabled = false;
        }
        self.store.save(&next)?;

        Ok(record)
    }

    async fn run_once(
        &self,
        task: &ScheduledTask,
        trigger: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> Result<RunRecord> {
        let skill_id = match &task.skill_id {
            Some(id) => Some(id.clone()),
            None => self.skills.match_skill(&task.description).await,
        };
        let skill_content = match &skill_id {
            Some(id) => self.skills.skill_content(id).await,
            None => None,
        };

        let context = self
            .resolver
            .resolve(&task.agent_id, &task.task_id, &Value::Object(task.context.clone()))
            .await?;

        let request = ExecutionRequest {
            agent_id: task.agent_id.clone(),
            kind: match trigger {
                TriggerKind::Scheduled => ExecutionKind::Task,
                TriggerKind::Manual | TriggerKind::Event => ExecutionKind::Trigger,
            },
            task_id: Some(task.task_id.clone()),
            instructions: task.instructions.clone(),
            context,
            skill_content,
            started_at,
        };

        let outcome = self
            .executor
            .execute(request)
            .await
            .map_err(|e| MusterError::Executor(e.to_string()))?;

        let (status, error) = match outcome.status {
            ExecutionStatus::Completed => (RunStatus::Completed, None),
            ExecutionStatus::Error => (
                RunStatus::Error,
                Some(outcome.error.unwrap_or_else(|| "executor error".into())),
            ),
        };
        Ok(RunRecord::new(&task.task_id, started_at, trigger, status, error))
    }

    /// Load a task, distinguishing "not yours" from "does not exist".
    fn owned_task(&self, agent_id: &str, task_id: &str) -> Result<ScheduledTask> {
        match self.store.load(agent_id, task_id) {
            Ok(task) => Ok(task),
            Err(MusterError::NotFound(_)) => match self.store.find_owner(task_id)? {
                Some(owner) if owner != agent_id => Err(MusterError::Ownership {
                    agent_id: agent_id.to_string(),
                    task_id: task_id.to_string(),
                }),
                _ => Err(MusterError::NotFound(format!(
                    "task '{task_id}' for agent '{agent_id}'"
                ))),
            },
            Err(e) => Err(e),
        }
    }
}

/// Synchronous validation at the API boundary.
fn validate_task(task: &ScheduledTask) -> Result<()> {
    if task.task_id.is_empty() {
        return Err(MusterError::Validation("task_id must not be empty".into()));
    }
    if !task
        .task_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || task.task_id.starts_with('.')
    {
        return Err(MusterError::Validation(format!(
            "task_id '{}' is not a safe directory name",
            task.task_id
        )));
    }
    if task.agent_id.is_empty() {
        return Err(MusterError::Validation("agent_id must not be empty".into()));
    }
    match &task.schedule {
        Schedule::Interval { every_secs } if *every_secs == 0 => Err(MusterError::Validation(
            "interval must be greater than zero seconds".into(),
        )),
        Schedule::Interval { every_secs } if *every_secs > calc::MAX_INTERVAL_SECS => {
            Err(MusterError::Validation(format!(
                "interval of {every_secs}s is out of range"
            )))
        }
        Schedule::Cron { expression } if calc::parse_cron(expression).is_none() => Err(
            MusterError::Validation(format!("invalid cron expression '{expression}'")),
        ),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use muster_core::traits::{
        ExecutionOutcome, NullCredentialStore, NullSkillMatcher, NullStateStore,
    };
    use serde_json::json;
    use std::sync::Mutex;

    /// Executor stub that records every request and answers from a script.
    struct ScriptedExecutor {
        requests: Mutex<Vec<ExecutionRequest>>,
        fail: bool,
    }

    impl ScriptedExecutor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                fail: true,
            })
        }

        fn seen(&self) -> Vec<ExecutionRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Executor for ScriptedExecutor {
        async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome> {
            self.requests.lock().unwrap().push(request);
            if self.fail {
                Ok(ExecutionOutcome::error("scripted failure"))
            } else {
                Ok(ExecutionOutcome::completed("done"))
            }
        }
    }

    fn scheduler(dir: &tempfile::TempDir, executor: Arc<dyn Executor>) -> TaskScheduler {
        let data_dir = dir.path().to_path_buf();
        TaskScheduler::new(
            TaskStore::new(&data_dir, 50),
            ContextResolver::new(
                Arc::new(NullCredentialStore),
                Arc::new(NullStateStore),
                data_dir,
            ),
            executor,
            Arc::new(NullSkillMatcher),
        )
    }

    fn interval_task(agent: &str, id: &str, secs: u64) -> ScheduledTask {
        ScheduledTask::new(agent, id, id, Schedule::Interval { every_secs: secs })
    }

    #[test]
    fn create_rejects_bad_schedules() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());

        let bad_interval = interval_task("a1", "t1", 0);
        assert!(matches!(
            sched.create_task(bad_interval),
            Err(MusterError::Validation(_))
        ));

        // Beyond the chrono Duration range: accepting it would let the
        // control loop hit unrepresentable date arithmetic later.
        let huge_interval = interval_task("a1", "t1", 10_u64.pow(16));
        assert!(matches!(
            sched.create_task(huge_interval),
            Err(MusterError::Validation(_))
        ));

        let bad_cron = ScheduledTask::new(
            "a1",
            "t2",
            "t2",
            Schedule::Cron {
                expression: "not cron".into(),
            },
        );
        assert!(matches!(
            sched.create_task(bad_cron),
            Err(MusterError::Validation(_))
        ));

        let mut bad_id = interval_task("a1", "t3", 60);
        bad_id.task_id = "../escape".into();
        assert!(matches!(
            sched.create_task(bad_id),
            Err(MusterError::Validation(_))
        ));
    }

    #[test]
    fn cross_agent_access_is_ownership_error() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());
        sched.create_task(interval_task("a1", "t1", 60)).unwrap();

        assert!(matches!(
            sched.get_task("a2", "t1"),
            Err(MusterError::Ownership { .. })
        ));
        assert!(matches!(
            sched.delete_task("a2", "t1"),
            Err(MusterError::Ownership { .. })
        ));
        // The task is untouched.
        assert!(sched.get_task("a1", "t1").is_ok());
    }

    #[test]
    fn interval_due_at_creation_then_after_interval() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());
        let task = sched.create_task(interval_task("a1", "t1", 60)).unwrap();

        let t0 = Utc::now();
        // Never run: due immediately.
        assert_eq!(sched.next_run_at(&task, t0), Some(t0));
        assert_eq!(sched.due_tasks("a1", t0).unwrap().len(), 1);

        // Ran at t0: not due again before t0+60.
        let mut ran = task.clone();
        ran.last_run_at = Some(t0);
        let next = sched.next_run_at(&ran, t0).unwrap();
        assert_eq!(next, t0 + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn fire_records_completed_run_and_advances_state() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::ok();
        let sched = scheduler(&dir, exec.clone());
        let mut task = interval_task("a1", "t1", 60);
        task.instructions = "check the server".into();
        sched.create_task(task).unwrap();

        let record = sched
            .fire_task("a1", "t1", TriggerKind::Scheduled)
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.trigger, TriggerKind::Scheduled);

        let task = sched.get_task("a1", "t1").unwrap();
        assert_eq!(task.run_count, 1);
        assert!(task.last_run_at.is_some());
        assert!(task.enabled);

        let seen = exec.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].instructions, "check the server");
        assert_eq!(seen[0].task_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn executor_failure_is_recorded_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::failing());
        sched.create_task(interval_task("a1", "t1", 60)).unwrap();

        let record = sched
            .fire_task("a1", "t1", TriggerKind::Scheduled)
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert_eq!(record.error.as_deref(), Some("scripted failure"));

        // Still scheduled: retries at the next natural fire time.
        let task = sched.get_task("a1", "t1").unwrap();
        assert!(task.enabled);
        assert!(sched.next_run_at(&task, Utc::now() + chrono::Duration::seconds(61)).is_some());
    }

    #[tokio::test]
    async fn resolution_failure_downgrades_to_error_record() {
        let dir = tempfile::tempdir().unwrap();
        let exec = ScriptedExecutor::ok();
        let sched = scheduler(&dir, exec.clone());
        let mut task = interval_task("a1", "t1", 60);
        task.context
            .insert("auth".into(), json!("$CREDENTIALS:missing$"));
        sched.create_task(task).unwrap();

        let record = sched
            .fire_task("a1", "t1", TriggerKind::Scheduled)
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.error.as_deref().unwrap().contains("CREDENTIALS"));

        // The executor never ran; the task remains enabled.
        assert!(exec.seen().is_empty());
        assert!(sched.get_task("a1", "t1").unwrap().enabled);
    }

    #[tokio::test]
    async fn manual_trigger_does_not_consume_once() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());
        let fire_at = Utc::now() + chrono::Duration::seconds(3600);
        let task = ScheduledTask::new("a1", "t1", "t1", Schedule::Once { at: fire_at });
        sched.create_task(task).unwrap();

        sched.trigger_task("a1", "t1").await.unwrap();
        let task = sched.get_task("a1", "t1").unwrap();
        assert!(task.enabled);
        // The fixed timestamp still stands.
        assert_eq!(sched.next_run_at(&task, Utc::now()), Some(fire_at));

        // The natural fire consumes it.
        sched.fire_task("a1", "t1", TriggerKind::Scheduled).await.unwrap();
        let task = sched.get_task("a1", "t1").unwrap();
        assert!(!task.enabled);
        assert_eq!(sched.next_run_at(&task, Utc::now()), None);
    }

    #[tokio::test]
    async fn event_only_never_due_but_fires_on_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());
        let task = ScheduledTask::new("a1", "t1", "t1", Schedule::EventOnly);
        sched.create_task(task).unwrap();

        assert!(sched.due_tasks("a1", Utc::now()).unwrap().is_empty());
        let record = sched.trigger_task("a1", "t1").await.unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(sched.due_tasks("a1", Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn instruction_edits_do_not_touch_config() {
        let dir = tempfile::tempdir().unwrap();
        let sched = scheduler(&dir, ScriptedExecutor::ok());
        sched.create_task(interval_task("a1", "t1", 60)).unwrap();

        sched.update_task(
            "a1",
            "t1",
            &TaskUpdate {
                name: Some("renamed".into()),
                ..Default::default()
            },
        )
        .unwrap();
        let task = sched.update_instructions("a1", "t1", "new text").unwrap();
        assert_eq!(task.name, "renamed");
        assert_eq!(task.instructions, "new text");
    }
}
