//! SchedulerHandle: client interface to the scheduler loop.
//!
//! Every task mutation travels over one channel to the loop, which applies
//! them one at a time. Read-only queries and pass-through CRUD (scripts,
//! notifiers, environment variables, history) go straight to the store.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, oneshot};

use crate::engine::SchedulerStats;
use crate::notify::{ChannelConfig, NotifierConfig};
use crate::persistence::{self, DEFAULT_LOG_LIMIT, DEFAULT_TASK_LOG_LIMIT, SchedulerDb};
use crate::records::RunRecord;
use crate::registry::ScriptRegistry;
use crate::tasks::{Task, TaskDraft};
use tempo_core::error::{Result, TempoError};

/// Requests handled by the scheduler loop.
pub(crate) enum SchedulerCommand {
    Start {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<Result<()>>,
    },
    /// Stop dispatching, wait for queued and running jobs, then exit.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    CreateTask {
        draft: TaskDraft,
        reply: oneshot::Sender<Result<Task>>,
    },
    UpdateTask {
        id: String,
        draft: TaskDraft,
        reply: oneshot::Sender<Result<Task>>,
    },
    DeleteTask {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ToggleTask {
        id: String,
        reply: oneshot::Sender<Result<Task>>,
    },
    RunTaskNow {
        id: String,
        reply: oneshot::Sender<Result<PendingRun>>,
    },
    RunScript {
        script_id: String,
        notify: bool,
        reply: oneshot::Sender<Result<PendingRun>>,
    },
    Stats {
        reply: oneshot::Sender<Result<SchedulerStats>>,
    },
}

/// A submitted run. Await it to get the stored record.
#[derive(Debug)]
pub struct PendingRun {
    rx: oneshot::Receiver<RunRecord>,
}

impl PendingRun {
    pub(crate) fn new(rx: oneshot::Receiver<RunRecord>) -> Self {
        Self { rx }
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunRecord> {
        self.rx
            .await
            .map_err(|_| TempoError::Scheduler("scheduler exited before the run finished".into()))
    }
}

/// Cloneable handle to a running scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<SchedulerCommand>,
    db: Arc<SchedulerDb>,
    scripts: ScriptRegistry,
    running: Arc<AtomicBool>,
}

impl SchedulerHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<SchedulerCommand>,
        db: Arc<SchedulerDb>,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            tx,
            scripts: ScriptRegistry::new(db.clone()),
            db,
            running,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> SchedulerCommand,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TempoError::Scheduler("scheduler channel closed".into()))?;
        rx.await
            .map_err(|_| TempoError::Scheduler("scheduler dropped the request".into()))
    }

    // ─── Lifecycle ────────────────────────────────────────────

    /// Begin timed dispatch. Missed runs are skipped, not caught up.
    pub async fn start(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::Start { reply }).await?
    }

    /// Stop timed dispatch. Runs already in progress finish and are recorded.
    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::Stop { reply }).await?
    }

    /// Stop, wait for all accepted runs to be recorded, and end the loop.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| SchedulerCommand::Shutdown { reply }).await
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    // ─── Tasks ────────────────────────────────────────────────

    pub async fn create_task(&self, draft: TaskDraft) -> Result<Task> {
        self.request(|reply| SchedulerCommand::CreateTask { draft, reply })
            .await?
    }

    pub async fn update_task(&self, id: &str, draft: TaskDraft) -> Result<Task> {
        let id = id.to_string();
        self.request(|reply| SchedulerCommand::UpdateTask { id, draft, reply })
            .await?
    }

    /// Does not cancel a run already in progress.
    pub async fn delete_task(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| SchedulerCommand::DeleteTask { id, reply })
            .await?
    }

    /// Flip between active and inactive.
    pub async fn toggle_task(&self, id: &str) -> Result<Task> {
        let id = id.to_string();
        self.request(|reply| SchedulerCommand::ToggleTask { id, reply })
            .await?
    }

    /// Queue a run of the task regardless of its schedule.
    pub async fn run_task_now(&self, id: &str) -> Result<PendingRun> {
        let id = id.to_string();
        self.request(|reply| SchedulerCommand::RunTaskNow { id, reply })
            .await?
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.db
            .get_task(id)?
            .ok_or_else(|| TempoError::not_found("task", id))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        self.db.list_tasks()
    }

    pub async fn stats(&self) -> Result<SchedulerStats> {
        self.request(|reply| SchedulerCommand::Stats { reply }).await?
    }

    // ─── Scripts ──────────────────────────────────────────────

    pub fn scripts(&self) -> &ScriptRegistry {
        &self.scripts
    }

    /// Run a script outside any task. Recorded without a task id.
    pub async fn run_script(&self, script_id: &str, notify: bool) -> Result<PendingRun> {
        let script_id = script_id.to_string();
        self.request(|reply| SchedulerCommand::RunScript {
            script_id,
            notify,
            reply,
        })
        .await?
    }

    // ─── Run Log ──────────────────────────────────────────────

    /// Newest first. `limit` defaults to 50 for one task, 100 overall.
    pub fn logs(&self, task_id: Option<&str>, limit: Option<usize>) -> Result<Vec<RunRecord>> {
        let limit = limit.unwrap_or(match task_id {
            Some(_) => DEFAULT_TASK_LOG_LIMIT,
            None => DEFAULT_LOG_LIMIT,
        });
        self.db.query_runs(task_id, limit)
    }

    // ─── Notifiers ────────────────────────────────────────────

    pub fn create_notifier(&self, name: &str, channel: ChannelConfig) -> Result<NotifierConfig> {
        let notifier = NotifierConfig::new(name, channel)?;
        self.db.save_notifier(&notifier)?;
        tracing::info!("🔔 Notifier added: '{}' ({})", notifier.name, notifier.channel.kind());
        Ok(notifier)
    }

    pub fn update_notifier(
        &self,
        id: &str,
        name: &str,
        channel: ChannelConfig,
    ) -> Result<NotifierConfig> {
        let mut notifier = self.get_notifier(id)?;
        notifier.name = name.trim().to_string();
        notifier.channel = channel;
        notifier.updated_at = persistence::now();
        notifier.validate()?;
        self.db.save_notifier(&notifier)?;
        Ok(notifier)
    }

    pub fn set_notifier_enabled(&self, id: &str, enabled: bool) -> Result<NotifierConfig> {
        let mut notifier = self.get_notifier(id)?;
        notifier.enabled = enabled;
        notifier.updated_at = persistence::now();
        self.db.save_notifier(&notifier)?;
        Ok(notifier)
    }

    pub fn get_notifier(&self, id: &str) -> Result<NotifierConfig> {
        self.db
            .get_notifier(id)?
            .ok_or_else(|| TempoError::not_found("notifier", id))
    }

    pub fn list_notifiers(&self) -> Result<Vec<NotifierConfig>> {
        self.db.list_notifiers()
    }

    pub fn delete_notifier(&self, id: &str) -> Result<()> {
        if !self.db.delete_notifier(id)? {
            return Err(TempoError::not_found("notifier", id));
        }
        Ok(())
    }

    // ─── Environment Variables ───────────────────────────────

    pub fn env_vars(&self) -> Result<Vec<(String, String)>> {
        self.db.env_vars()
    }

    /// Takes effect for runs started afterwards.
    pub fn set_env_var(&self, key: &str, value: &str) -> Result<()> {
        self.db.set_env_var(key, value)
    }

    pub fn delete_env_var(&self, key: &str) -> Result<()> {
        if !self.db.delete_env_var(key)? {
            return Err(TempoError::not_found("environment variable", key));
        }
        Ok(())
    }
}
