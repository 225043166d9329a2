//! Scheduler Engine: the loop that owns task state and dispatches runs.
//!
//! A single tokio task receives commands, run completions and timer ticks,
//! so within a process every change to a task is made by one writer. The
//! task table is re-read on each tick, so edits made by other processes on
//! the same database (the CLI) take effect without a restart; run
//! bookkeeping only ever updates existing rows. Runs execute on spawned
//! tasks, capped by a FIFO [`WorkerPool`]. A task is never queued or
//! running twice at the same time within one engine.

use chrono::{DateTime, Local, Utc};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::dispatch::{Notifier, NotifyDispatcher};
use crate::handle::{PendingRun, SchedulerCommand, SchedulerHandle};
use crate::persistence::{self, SchedulerDb};
use crate::pool::{PoolStats, WorkerPool};
use crate::records::{RunOutcome, RunRecord, RunStatus};
use crate::registry::ScriptRegistry;
use crate::runner::{ProcessRunner, RunEnv, ScriptRunner};
use crate::schedule::Schedule;
use crate::scripts::Script;
use crate::tasks::{Task, TaskDraft, TaskStatus};
use tempo_core::config::{SchedulerConfig, TempoConfig};
use tempo_core::error::{Result, TempoError};

const COMMAND_BUFFER: usize = 64;

/// What caused a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// The task's next_run_at elapsed.
    Scheduled,
    /// Run-now on a task; leaves next_run_at alone.
    Manual,
    /// A script run outside any task.
    AdHoc,
}

/// Bookkeeping that travels with a run and comes back on completion.
struct RunMeta {
    trigger: Trigger,
    task_id: Option<String>,
    name: String,
    script_id: String,
    notify: bool,
    reply: Option<oneshot::Sender<RunRecord>>,
}

struct RunJob {
    meta: RunMeta,
    script: Script,
    env: RunEnv,
}

struct RunDone {
    meta: RunMeta,
    record: RunRecord,
}

/// Aggregate view for dashboards and the CLI.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SchedulerStats {
    pub total_tasks: u64,
    pub active_tasks: u64,
    pub total_runs: u64,
    pub success_runs: u64,
    pub failed_runs: u64,
    pub running: bool,
    pub pool: PoolStats,
}

/// The scheduler engine: owns the task set and the worker pool.
pub struct SchedulerEngine {
    db: Arc<SchedulerDb>,
    scripts: ScriptRegistry,
    runner: Arc<dyn ScriptRunner>,
    notifier: Arc<dyn Notifier>,
    tasks: HashMap<String, Task>,
    /// Task ids queued or running.
    in_flight: HashSet<String>,
    pool: WorkerPool<RunJob>,
    running: Arc<AtomicBool>,
    tick: Duration,
    done_tx: mpsc::UnboundedSender<RunDone>,
}

impl SchedulerEngine {
    /// Spawn the loop (stopped) and return a handle to it.
    pub fn spawn(
        db: Arc<SchedulerDb>,
        runner: Arc<dyn ScriptRunner>,
        notifier: Arc<dyn Notifier>,
        config: &SchedulerConfig,
    ) -> Result<SchedulerHandle> {
        let tasks = db
            .list_tasks()?
            .into_iter()
            .map(|t| (t.id.clone(), t))
            .collect();
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let running = Arc::new(AtomicBool::new(false));

        let engine = Self {
            scripts: ScriptRegistry::new(db.clone()),
            db: db.clone(),
            runner,
            notifier,
            tasks,
            in_flight: HashSet::new(),
            pool: WorkerPool::new(config.max_concurrent),
            running: running.clone(),
            tick: Duration::from_millis(config.tick_interval_ms.max(1)),
            done_tx,
        };
        tokio::spawn(engine.run(cmd_rx, done_rx));
        Ok(SchedulerHandle::new(cmd_tx, db, running))
    }

    /// Open the database under the configured data dir and wire the real
    /// process runner and HTTP notifier.
    pub fn from_config(config: &TempoConfig) -> Result<SchedulerHandle> {
        config.validate()?;
        let db = Arc::new(SchedulerDb::open(&config.db_path())?);
        let runner = Arc::new(ProcessRunner::from_config(config));
        let notifier = Arc::new(NotifyDispatcher::new(config.notify.clone()));
        Self::spawn(db, runner, notifier, &config.scheduler)
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SchedulerCommand>,
        mut done: mpsc::UnboundedReceiver<RunDone>,
    ) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut draining = false;
        let mut shutdown_reply: Option<oneshot::Sender<()>> = None;

        loop {
            if draining && self.pool.is_idle() {
                break;
            }
            tokio::select! {
                Some(finished) = done.recv() => self.on_done(finished),
                cmd = commands.recv(), if !draining => match cmd {
                    Some(SchedulerCommand::Shutdown { reply }) => {
                        tracing::info!("🛑 Scheduler shutting down ({} runs outstanding)", self.in_flight_count());
                        self.running.store(false, Ordering::SeqCst);
                        draining = true;
                        shutdown_reply = Some(reply);
                    }
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle is gone; finish what was accepted.
                        self.running.store(false, Ordering::SeqCst);
                        draining = true;
                    }
                },
                _ = interval.tick() => self.on_tick(),
            }
        }

        tracing::info!("🛑 Scheduler loop exited");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn in_flight_count(&self) -> usize {
        let stats = self.pool.stats();
        stats.active + stats.queued
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn handle_command(&mut self, cmd: SchedulerCommand) {
        match cmd {
            SchedulerCommand::Start { reply } => {
                let _ = reply.send(self.start());
            }
            SchedulerCommand::Stop { reply } => {
                if self.running.swap(false, Ordering::SeqCst) {
                    tracing::info!("⏸️ Scheduler stopped");
                }
                let _ = reply.send(Ok(()));
            }
            SchedulerCommand::Shutdown { reply } => {
                // Handled by the loop; reaching here means a second request.
                let _ = reply.send(());
            }
            SchedulerCommand::CreateTask { draft, reply } => {
                let _ = reply.send(self.create_task(draft));
            }
            SchedulerCommand::UpdateTask { id, draft, reply } => {
                let _ = reply.send(self.update_task(&id, draft));
            }
            SchedulerCommand::DeleteTask { id, reply } => {
                let _ = reply.send(self.delete_task(&id));
            }
            SchedulerCommand::ToggleTask { id, reply } => {
                let _ = reply.send(self.toggle_task(&id));
            }
            SchedulerCommand::RunTaskNow { id, reply } => {
                let _ = reply.send(self.run_task_now(&id));
            }
            SchedulerCommand::RunScript {
                script_id,
                notify,
                reply,
            } => {
                let _ = reply.send(self.run_script(&script_id, notify));
            }
            SchedulerCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }

        // Mutations may have made something due right now.
        self.on_tick();
    }

    // ─── Lifecycle ────────────────────────────────────────────

    fn start(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.reload_tasks();
        let now = Utc::now();
        for task in self.tasks.values_mut().filter(|t| t.is_active()) {
            if task.next_run_at.is_none_or(|next| next < now) {
                task.next_run_at = next_run_or_warn(task);
                store_next_run(&self.db, task);
            }
        }
        tracing::info!(
            "⏰ Scheduler started ({} active tasks, max {} concurrent, tick {}ms)",
            self.tasks.values().filter(|t| t.is_active()).count(),
            self.pool.stats().max_concurrent,
            self.tick.as_millis()
        );
        self.dispatch_due(now);
        Ok(())
    }

    // ─── Task mutations ──────────────────────────────────────

    fn require_script(&self, script_id: &str) -> Result<Script> {
        self.scripts.get(script_id)
    }

    /// Replace the cached task set with the table. Other processes (the CLI)
    /// write to the same database, so the table is authoritative.
    fn reload_tasks(&mut self) {
        match self.db.list_tasks() {
            Ok(tasks) => {
                self.tasks = tasks.into_iter().map(|t| (t.id.clone(), t)).collect();
            }
            Err(e) => tracing::warn!("⚠️ Failed to reload tasks: {e}"),
        }
    }

    /// Fresh copy of one task from the table, refreshing the cache.
    fn current_task(&mut self, id: &str) -> Result<Task> {
        match self.db.get_task(id)? {
            Some(task) => {
                self.tasks.insert(task.id.clone(), task.clone());
                Ok(task)
            }
            None => {
                self.tasks.remove(id);
                Err(TempoError::not_found("task", id))
            }
        }
    }

    fn create_task(&mut self, draft: TaskDraft) -> Result<Task> {
        draft.validate()?;
        self.require_script(&draft.script_id)?;
        let mut task = Task::from_draft(draft)?;
        // Rejects schedules that never fire, even for inactive tasks
        let next = next_run(&task.schedule)?;
        task.next_run_at = task.is_active().then_some(next);
        self.db.save_task(&task)?;
        tracing::info!("📅 Task added: '{}' ({}) [{}]", task.name, task.id, task.cron);
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn update_task(&mut self, id: &str, draft: TaskDraft) -> Result<Task> {
        let mut task = self.current_task(id)?;
        draft.validate()?;
        self.require_script(&draft.script_id)?;
        task.apply(draft)?;
        let next = next_run(&task.schedule)?;
        task.next_run_at = task.is_active().then_some(next);
        self.db.save_task(&task)?;
        tracing::info!("📝 Task updated: '{}' ({}) [{}]", task.name, task.id, task.cron);
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    fn delete_task(&mut self, id: &str) -> Result<()> {
        self.current_task(id)?;
        self.db.delete_task(id)?;
        if let Some(task) = self.tasks.remove(id) {
            tracing::info!("🗑️ Task deleted: '{}' ({})", task.name, task.id);
        }
        Ok(())
    }

    fn toggle_task(&mut self, id: &str) -> Result<Task> {
        let mut task = self.current_task(id)?;
        match task.status {
            TaskStatus::Active => {
                task.status = TaskStatus::Inactive;
                task.next_run_at = None;
            }
            TaskStatus::Inactive => {
                task.next_run_at = Some(next_run(&task.schedule)?);
                task.status = TaskStatus::Active;
            }
        }
        task.updated_at = persistence::now();
        self.db.save_task(&task)?;
        tracing::info!("🔀 Task '{}' is now {}", task.name, task.status);
        self.tasks.insert(task.id.clone(), task.clone());
        Ok(task)
    }

    // ─── Dispatch ────────────────────────────────────────────

    fn run_task_now(&mut self, id: &str) -> Result<PendingRun> {
        let task = self.current_task(id)?;
        if self.in_flight.contains(id) {
            return Err(TempoError::Scheduler(format!(
                "task '{}' is already queued or running",
                task.name
            )));
        }
        let (tx, rx) = oneshot::channel();
        let meta = RunMeta {
            trigger: Trigger::Manual,
            task_id: Some(task.id.clone()),
            name: task.name.clone(),
            script_id: task.script_id.clone(),
            notify: true,
            reply: Some(tx),
        };
        tracing::info!("▶️ Run now: '{}'", meta.name);
        self.submit(meta);
        Ok(PendingRun::new(rx))
    }

    fn run_script(&mut self, script_id: &str, notify: bool) -> Result<PendingRun> {
        let script = self.require_script(script_id)?;
        let (tx, rx) = oneshot::channel();
        let meta = RunMeta {
            trigger: Trigger::AdHoc,
            task_id: None,
            name: format!("{} (manual)", script.name),
            script_id: script.id.clone(),
            notify,
            reply: Some(tx),
        };
        tracing::info!("▶️ Run script: '{}'", script.name);
        self.enqueue(meta, script);
        Ok(PendingRun::new(rx))
    }

    fn on_tick(&mut self) {
        if self.is_running() {
            self.reload_tasks();
            self.dispatch_due(Utc::now());
        }
    }

    /// Queue every active task whose next run has passed, oldest first.
    fn dispatch_due(&mut self, now: DateTime<Utc>) {
        let mut due: Vec<(DateTime<Utc>, String)> = self
            .tasks
            .values()
            .filter(|t| t.is_due(now) && !self.in_flight.contains(&t.id))
            .filter_map(|t| t.next_run_at.map(|at| (at, t.id.clone())))
            .collect();
        if due.is_empty() {
            return;
        }
        due.sort();

        for (_, id) in due {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };
            tracing::info!("🔔 Task due: '{}'", task.name);
            let meta = RunMeta {
                trigger: Trigger::Scheduled,
                task_id: Some(task.id.clone()),
                name: task.name.clone(),
                script_id: task.script_id.clone(),
                notify: true,
                reply: None,
            };
            self.submit(meta);
        }
    }

    /// Resolve the script and queue the run. A dangling script reference
    /// is recorded as a failed run instead of being retried every tick.
    fn submit(&mut self, meta: RunMeta) {
        match self.scripts.find(&meta.script_id) {
            Ok(Some(script)) => self.enqueue(meta, script),
            Ok(None) => {
                let reason = format!("script {} no longer exists", meta.script_id);
                tracing::warn!("⚠️ Task '{}' cannot run: {reason}", meta.name);
                self.finish_unrun(meta, reason);
            }
            Err(e) => {
                tracing::warn!("⚠️ Task '{}' cannot run: {e}", meta.name);
                self.finish_unrun(meta, e.to_string());
            }
        }
    }

    fn finish_unrun(&mut self, meta: RunMeta, reason: String) {
        let now = Utc::now();
        let record = RunRecord::new(
            meta.task_id.clone(),
            &meta.name,
            now,
            now,
            RunOutcome::error(reason),
        );
        self.finish(meta, record);
    }

    fn enqueue(&mut self, meta: RunMeta, script: Script) {
        let env = match self.db.env_vars() {
            Ok(vars) => RunEnv { vars },
            Err(e) => {
                tracing::warn!("⚠️ Failed to load environment variables: {e}");
                RunEnv::default()
            }
        };
        if let Some(task_id) = &meta.task_id {
            self.in_flight.insert(task_id.clone());
        }
        self.pool.enqueue(RunJob { meta, script, env });
        self.pump();
    }

    /// Start queued jobs while slots are free.
    fn pump(&mut self) {
        while let Some(job) = self.pool.next() {
            self.launch(job);
        }
        let stats = self.pool.stats();
        if stats.queued > 0 {
            tracing::debug!(
                "📥 {} runs waiting ({} of {} slots busy)",
                stats.queued,
                stats.active,
                stats.max_concurrent
            );
        }
    }

    fn launch(&self, job: RunJob) {
        let runner = self.runner.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            let RunJob { meta, script, env } = job;
            let started = Utc::now();
            let outcome = AssertUnwindSafe(runner.run(&script, &env))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| RunOutcome::error("runner panicked"));
            let record =
                RunRecord::new(meta.task_id.clone(), &meta.name, started, Utc::now(), outcome);
            let _ = done_tx.send(RunDone { meta, record });
        });
    }

    // ─── Completion ──────────────────────────────────────────

    fn on_done(&mut self, done: RunDone) {
        self.pool.complete();
        self.finish(done.meta, done.record);
        self.pump();
    }

    /// Record the outcome, advance the task, and hand off notifications.
    fn finish(&mut self, meta: RunMeta, record: RunRecord) {
        if let Err(e) = self.db.append_run(&record) {
            tracing::warn!("⚠️ Failed to record run of '{}': {e}", meta.name);
        }

        if let Some(task_id) = &meta.task_id {
            self.in_flight.remove(task_id);
            // Deleted meanwhile: nothing to advance, and nothing is re-inserted
            if let Some(task) = self.tasks.get_mut(task_id) {
                task.last_run_at = Some(record.started_at);
                if let Err(e) = self.db.set_task_last_run(task_id, record.started_at) {
                    tracing::warn!("⚠️ Failed to save task '{}': {e}", task.name);
                }
                if meta.trigger == Trigger::Scheduled {
                    task.next_run_at = if task.is_active() {
                        next_run_or_warn(task)
                    } else {
                        None
                    };
                    store_next_run(&self.db, task);
                }
            }
        }

        if record.status != RunStatus::Error
            && let Err(e) = self.scripts.mark_run(&meta.script_id, record.started_at)
        {
            tracing::warn!("⚠️ Failed to update script {}: {e}", meta.script_id);
        }

        if record.success {
            tracing::info!(
                "✅ '{}' succeeded in {}ms",
                record.task_name,
                record.duration_ms
            );
        } else {
            tracing::warn!(
                "❌ '{}' {} after {}ms: {}",
                record.task_name,
                record.status,
                record.duration_ms,
                record.error.lines().next().unwrap_or_default()
            );
        }

        if meta.notify {
            self.notify(&record);
        }
        if let Some(reply) = meta.reply {
            let _ = reply.send(record);
        }
    }

    fn notify(&self, record: &RunRecord) {
        let targets = match self.db.enabled_notifiers() {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!("⚠️ Failed to load notifiers: {e}");
                return;
            }
        };
        if targets.is_empty() {
            return;
        }
        let notifier = self.notifier.clone();
        let record = record.clone();
        tokio::spawn(async move {
            notifier.notify(&record, &targets).await;
        });
    }

    fn stats(&mut self) -> Result<SchedulerStats> {
        self.reload_tasks();
        let counts = self.db.run_counts()?;
        Ok(SchedulerStats {
            total_tasks: self.tasks.len() as u64,
            active_tasks: self.tasks.values().filter(|t| t.is_active()).count() as u64,
            total_runs: counts.total,
            success_runs: counts.success,
            failed_runs: counts.failed,
            running: self.is_running(),
            pool: self.pool.stats(),
        })
    }
}

/// Next trigger in the process's local time zone.
fn next_run(schedule: &Schedule) -> Result<DateTime<Utc>> {
    schedule
        .next_after(&Local::now())
        .map(|t| t.with_timezone(&Utc))
}

fn next_run_or_warn(task: &Task) -> Option<DateTime<Utc>> {
    match next_run(&task.schedule) {
        Ok(at) => Some(at),
        Err(e) => {
            tracing::warn!("⚠️ Task '{}' has no next run: {e}", task.name);
            None
        }
    }
}

fn store_next_run(db: &SchedulerDb, task: &Task) {
    if let Err(e) = db.set_task_next_run(&task.id, task.next_run_at) {
        tracing::warn!("⚠️ Failed to save task '{}': {e}", task.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::{ChannelConfig, NotifierConfig};
    use crate::scripts::{ScriptDraft, ScriptKind};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a fixed outcome after a delay.
    struct FakeRunner {
        delay: Duration,
        outcome: RunOutcome,
    }

    #[async_trait]
    impl ScriptRunner for FakeRunner {
        async fn run(&self, _script: &Script, _env: &RunEnv) -> RunOutcome {
            tokio::time::sleep(self.delay).await;
            self.outcome.clone()
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, record: &RunRecord, targets: &[NotifierConfig]) {
            self.seen
                .lock()
                .unwrap()
                .push((record.task_name.clone(), targets.len()));
        }
    }

    fn config(max_concurrent: usize) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval_ms: 20,
            max_concurrent,
        }
    }

    fn setup(
        outcome: RunOutcome,
    ) -> (Arc<SchedulerDb>, Arc<RecordingNotifier>, SchedulerHandle) {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::default());
        let runner = Arc::new(FakeRunner {
            delay: Duration::from_millis(10),
            outcome,
        });
        let handle =
            SchedulerEngine::spawn(db.clone(), runner, notifier.clone(), &config(2)).unwrap();
        (db, notifier, handle)
    }

    fn daily() -> Schedule {
        Schedule::Daily { hour: 3, minute: 0 }
    }

    #[tokio::test]
    async fn test_create_requires_existing_script() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let err = handle
            .create_task(TaskDraft::new("t", "missing", daily()))
            .await
            .unwrap_err();
        assert!(matches!(err, TempoError::NotFound { .. }));
        assert!(handle.list_tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_rejects_bad_schedule() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let err = handle
            .create_task(TaskDraft::new(
                "t",
                &script.id,
                Schedule::Weekly {
                    hour: 1,
                    minute: 0,
                    weekdays: vec![],
                },
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidSchedule(_)));
    }

    #[tokio::test]
    async fn test_never_firing_schedule_rejected_while_inactive() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let feb_30 = Schedule::Custom {
            expression: "0 0 0 30 2 *".into(),
        };
        let err = handle
            .create_task(TaskDraft::new("t", &script.id, feb_30.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidSchedule(_)));

        let task = handle
            .create_task(TaskDraft::new("t", &script.id, daily()))
            .await
            .unwrap();
        let err = handle
            .update_task(&task.id, TaskDraft::new("t", &script.id, feb_30))
            .await
            .unwrap_err();
        assert!(matches!(err, TempoError::InvalidSchedule(_)));
        assert_eq!(handle.get_task(&task.id).unwrap().cron, "0 0 3 * * *");
    }

    #[tokio::test]
    async fn test_toggle_sets_and_clears_next_run() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let task = handle
            .create_task(TaskDraft::new("t", &script.id, daily()))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert!(task.next_run_at.is_none());

        let task = handle.toggle_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        let next = task.next_run_at.unwrap();
        assert!(next > Utc::now());
        assert_eq!(handle.get_task(&task.id).unwrap().next_run_at, Some(next));

        let task = handle.toggle_task(&task.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Inactive);
        assert!(task.next_run_at.is_none());
    }

    #[tokio::test]
    async fn test_run_now_records_and_notifies_without_moving_next_run() {
        let (db, notifier, handle) = setup(RunOutcome::success("[NOTIFY] hi".into()));
        db.save_notifier(
            &NotifierConfig::new(
                "hook",
                ChannelConfig::Webhook {
                    webhook: "http://127.0.0.1:9/x".into(),
                },
            )
            .unwrap(),
        )
        .unwrap();
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let task = handle
            .create_task(TaskDraft::new("nightly", &script.id, daily()).active())
            .await
            .unwrap();

        // Works while the loop is stopped
        let record = handle.run_task_now(&task.id).await.unwrap().wait().await.unwrap();
        assert!(record.success);
        assert_eq!(record.task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(record.task_name, "nightly");

        let stored = handle.get_task(&task.id).unwrap();
        assert_eq!(stored.next_run_at, task.next_run_at);
        assert_eq!(stored.last_run_at, Some(record.started_at));
        assert!(handle.scripts().get(&script.id).unwrap().last_run_at.is_some());
        assert_eq!(handle.logs(Some(&task.id), None).unwrap(), vec![record]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            notifier.seen.lock().unwrap().clone(),
            vec![("nightly".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_run_script_without_notify() {
        let (db, notifier, handle) = setup(RunOutcome::success("done".into()));
        db.save_notifier(
            &NotifierConfig::new(
                "hook",
                ChannelConfig::Webhook {
                    webhook: "http://127.0.0.1:9/x".into(),
                },
            )
            .unwrap(),
        )
        .unwrap();
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("cleanup", ScriptKind::Shell, "echo"))
            .unwrap();
        let record = handle
            .run_script(&script.id, false)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert!(record.task_id.is_none());
        assert_eq!(record.task_name, "cleanup (manual)");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(notifier.seen.lock().unwrap().is_empty());

        assert!(handle.run_script("nope", true).await.is_err());
    }

    #[tokio::test]
    async fn test_missing_script_at_dispatch_is_recorded() {
        let (db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let task = handle
            .create_task(TaskDraft::new("orphan", &script.id, daily()))
            .await
            .unwrap();
        // Remove the script behind the registry's back
        db.delete_script(&script.id).unwrap();

        let record = handle.run_task_now(&task.id).await.unwrap().wait().await.unwrap();
        assert_eq!(record.status, RunStatus::Error);
        assert!(record.error.contains("no longer exists"));
        assert_eq!(db.run_counts().unwrap().failed, 1);
    }

    #[tokio::test]
    async fn test_failed_runs_counted_in_stats() {
        let (_db, _n, handle) =
            setup(RunOutcome::failed(String::new(), "exited with code 1".into()));
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "exit 1"))
            .unwrap();
        let task = handle
            .create_task(TaskDraft::new("t", &script.id, daily()).active())
            .await
            .unwrap();
        handle.run_task_now(&task.id).await.unwrap().wait().await.unwrap();
        handle.start().await.unwrap();

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.total_tasks, 1);
        assert_eq!(stats.active_tasks, 1);
        assert_eq!(stats.total_runs, 1);
        assert_eq!(stats.failed_runs, 1);
        assert!(stats.running);
        assert!(handle.is_running());

        handle.stop().await.unwrap();
        assert!(!handle.stats().await.unwrap().running);
    }

    #[tokio::test]
    async fn test_update_notifier_replaces_channel() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        let created = handle
            .create_notifier(
                "ops",
                ChannelConfig::Dingtalk {
                    webhook: "https://oapi.dingtalk.com/robot/send?access_token=x".into(),
                },
            )
            .unwrap();

        let lark = ChannelConfig::Lark {
            webhook: "https://open.feishu.cn/hook/y".into(),
            secret: Some("s".into()),
        };
        let updated = handle
            .update_notifier(&created.id, " ops-lark ", lark.clone())
            .unwrap();
        assert_eq!(updated.name, "ops-lark");
        assert_eq!(updated.created_at, created.created_at);

        let stored = handle.get_notifier(&created.id).unwrap();
        assert_eq!(stored.channel, lark);
        assert_eq!(stored.updated_at, updated.updated_at);

        let bad = ChannelConfig::Webhook {
            webhook: "ftp://nope".into(),
        };
        assert!(handle.update_notifier(&created.id, "ops", bad).is_err());
        assert!(handle.update_notifier("missing", "ops", lark).is_err());
        assert_eq!(handle.get_notifier(&created.id).unwrap().name, "ops-lark");
    }

    #[tokio::test]
    async fn test_delete_unknown_task() {
        let (_db, _n, handle) = setup(RunOutcome::success("ok".into()));
        assert!(matches!(
            handle.delete_task("nope").await,
            Err(TempoError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_runs() {
        let db = Arc::new(SchedulerDb::open_in_memory().unwrap());
        let runner = Arc::new(FakeRunner {
            delay: Duration::from_millis(200),
            outcome: RunOutcome::success("ok".into()),
        });
        let handle = SchedulerEngine::spawn(
            db.clone(),
            runner,
            Arc::new(RecordingNotifier::default()),
            &config(1),
        )
        .unwrap();
        let script = handle
            .scripts()
            .create(ScriptDraft::inline("s", ScriptKind::Shell, "echo"))
            .unwrap();
        let _a = handle.run_script(&script.id, false).await.unwrap();
        let _b = handle.run_script(&script.id, false).await.unwrap();

        handle.shutdown().await.unwrap();
        assert_eq!(db.run_counts().unwrap().total, 2);
        assert!(handle.start().await.is_err());
    }
}
