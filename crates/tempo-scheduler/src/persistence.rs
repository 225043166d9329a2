//! SQLite-backed persistence for scripts, tasks, run history, notifier
//! configs and global environment variables.
//!
//! One connection behind a mutex; every write is a single statement, so
//! concurrent appends from different runs never interleave.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::notify::{ChannelConfig, NotifierConfig};
use crate::records::{RunCounts, RunRecord, RunStatus};
use crate::scripts::{Script, ScriptKind, ScriptSource};
use crate::schedule::Schedule;
use crate::tasks::{Task, TaskStatus};
use tempo_core::error::{Result, TempoError};

/// Default page size for a single task's history.
pub const DEFAULT_TASK_LOG_LIMIT: usize = 50;
/// Default page size for the combined history.
pub const DEFAULT_LOG_LIMIT: usize = 100;

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db("DB open"))?;

        // WAL lets history queries run while a run is being appended
        conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db("DB busy timeout"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// In-memory database, mostly for tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db("DB open"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TempoError::Database(format!("Lock: {e}")))
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.lock()?
            .execute_batch(
                "
            CREATE TABLE IF NOT EXISTS scripts (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                kind TEXT NOT NULL,              -- 'python', 'nodejs', 'shell'
                source TEXT NOT NULL,            -- JSON: {source:path,path} or {source:inline,code}
                tags TEXT NOT NULL DEFAULT '[]', -- JSON array
                timeout_secs INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run_at TEXT
            );

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                script_id TEXT NOT NULL,
                schedule TEXT NOT NULL,          -- JSON, tagged by kind
                cron TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'inactive',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_run_at TEXT,
                next_run_at TEXT
            );

            -- Append-only run history
            CREATE TABLE IF NOT EXISTS run_records (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                task_id TEXT,                    -- NULL for ad-hoc script runs
                task_name TEXT NOT NULL,
                started_at TEXT NOT NULL,
                ended_at TEXT NOT NULL,
                duration_ms INTEGER NOT NULL,
                output TEXT NOT NULL DEFAULT '',
                error TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,            -- 'success', 'failed', 'timeout', 'error'
                success INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_run_records_started ON run_records(started_at);
            CREATE INDEX IF NOT EXISTS idx_run_records_task ON run_records(task_id, started_at);

            CREATE TABLE IF NOT EXISTS notifiers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                channel TEXT NOT NULL,           -- JSON, tagged by type
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS env_vars (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
         ",
            )
            .map_err(db("Migration"))?;
        Ok(())
    }

    // ─── Scripts ──────────────────────────────────────────────

    /// Insert or replace a script.
    pub fn save_script(&self, script: &Script) -> Result<()> {
        let source = serde_json::to_string(&script.source)?;
        let tags = serde_json::to_string(&script.tags)?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO scripts
                 (id, name, description, kind, source, tags, timeout_secs, created_at, updated_at, last_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    script.id,
                    script.name,
                    script.description,
                    script.kind.as_str(),
                    source,
                    tags,
                    script.timeout_secs.map(|t| t as i64),
                    ts(&script.created_at),
                    ts(&script.updated_at),
                    script.last_run_at.as_ref().map(ts),
                ],
            )
            .map_err(db("Save script"))?;
        Ok(())
    }

    /// Update editable fields only; `last_run_at` belongs to the scheduler.
    /// The kind may only change while the script has never run, checked in
    /// the same statement so a run finishing concurrently cannot slip past.
    pub fn update_script(&self, script: &Script) -> Result<()> {
        let source = serde_json::to_string(&script.source)?;
        let tags = serde_json::to_string(&script.tags)?;
        let conn = self.lock()?;
        let n = conn
            .execute(
                "UPDATE scripts SET name = ?2, description = ?3, kind = ?4, source = ?5, tags = ?6,
                 timeout_secs = ?7, updated_at = ?8
                 WHERE id = ?1 AND (last_run_at IS NULL OR kind = ?4)",
                params![
                    script.id,
                    script.name,
                    script.description,
                    script.kind.as_str(),
                    source,
                    tags,
                    script.timeout_secs.map(|t| t as i64),
                    ts(&script.updated_at),
                ],
            )
            .map_err(db("Update script"))?;
        if n > 0 {
            return Ok(());
        }
        let exists = conn
            .query_row("SELECT 1 FROM scripts WHERE id = ?1", [&script.id], |_| Ok(()))
            .optional()
            .map_err(db("Update script"))?
            .is_some();
        if exists {
            Err(TempoError::Validation(format!(
                "script {} has run history; its type cannot change",
                script.id
            )))
        } else {
            Err(TempoError::not_found("script", script.id.as_str()))
        }
    }

    pub fn get_script(&self, id: &str) -> Result<Option<Script>> {
        let row = self
            .lock()?
            .query_row(
                &format!("SELECT {SCRIPT_COLUMNS} FROM scripts WHERE id = ?1"),
                [id],
                ScriptRow::from_row,
            )
            .optional()
            .map_err(db("Get script"))?;
        row.map(ScriptRow::into_script).transpose()
    }

    pub fn list_scripts(&self) -> Result<Vec<Script>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {SCRIPT_COLUMNS} FROM scripts ORDER BY created_at, rowid"
            ))
            .map_err(db("List scripts"))?;
        let rows = stmt
            .query_map([], ScriptRow::from_row)
            .map_err(db("List scripts"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("List scripts"))?;
        rows.into_iter().map(ScriptRow::into_script).collect()
    }

    /// Returns false when nothing was deleted.
    pub fn delete_script(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM scripts WHERE id = ?1", [id])
            .map_err(db("Delete script"))?;
        Ok(n > 0)
    }

    pub fn mark_script_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.lock()?
            .execute(
                "UPDATE scripts SET last_run_at = ?2 WHERE id = ?1",
                params![id, ts(&at)],
            )
            .map_err(db("Mark script run"))?;
        Ok(())
    }

    /// Number of tasks referencing a script.
    pub fn tasks_using_script(&self, script_id: &str) -> Result<u64> {
        self.lock()?
            .query_row(
                "SELECT COUNT(*) FROM tasks WHERE script_id = ?1",
                [script_id],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
            .map_err(db("Count tasks"))
    }

    // ─── Tasks ────────────────────────────────────────────────

    /// Insert or replace a task.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let schedule = serde_json::to_string(&task.schedule)?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO tasks
                 (id, name, description, script_id, schedule, cron, status, created_at, updated_at,
                  last_run_at, next_run_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    task.id,
                    task.name,
                    task.description,
                    task.script_id,
                    schedule,
                    task.cron,
                    task.status.as_str(),
                    ts(&task.created_at),
                    ts(&task.updated_at),
                    task.last_run_at.as_ref().map(ts),
                    task.next_run_at.as_ref().map(ts),
                ],
            )
            .map_err(db("Save task"))?;
        Ok(())
    }

    pub fn get_task(&self, id: &str) -> Result<Option<Task>> {
        let row = self
            .lock()?
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                [id],
                TaskRow::from_row,
            )
            .optional()
            .map_err(db("Get task"))?;
        row.map(TaskRow::into_task).transpose()
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at, rowid"
            ))
            .map_err(db("List tasks"))?;
        let rows = stmt
            .query_map([], TaskRow::from_row)
            .map_err(db("List tasks"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("List tasks"))?;
        rows.into_iter().map(TaskRow::into_task).collect()
    }

    pub fn delete_task(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM tasks WHERE id = ?1", [id])
            .map_err(db("Delete task"))?;
        Ok(n > 0)
    }

    /// Record a run on an existing task. Never inserts; returns false when
    /// the task is gone.
    pub fn set_task_last_run(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "UPDATE tasks SET last_run_at = ?2 WHERE id = ?1",
                params![id, ts(&at)],
            )
            .map_err(db("Update task last run"))?;
        Ok(n > 0)
    }

    /// Set the next trigger of an existing task. A task that is no longer
    /// active in the table gets NULL whatever is passed.
    pub fn set_task_next_run(&self, id: &str, next: Option<DateTime<Utc>>) -> Result<bool> {
        let n = self
            .lock()?
            .execute(
                "UPDATE tasks SET next_run_at = CASE WHEN status = 'active' THEN ?2 ELSE NULL END
                 WHERE id = ?1",
                params![id, next.as_ref().map(ts)],
            )
            .map_err(db("Update task next run"))?;
        Ok(n > 0)
    }

    // ─── Run Log ──────────────────────────────────────────────

    /// Append one run record. Records are never updated afterwards.
    pub fn append_run(&self, record: &RunRecord) -> Result<()> {
        self.lock()?
            .execute(
                "INSERT INTO run_records
                 (id, task_id, task_name, started_at, ended_at, duration_ms, output, error, status, success)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    record.id,
                    record.task_id,
                    record.task_name,
                    ts(&record.started_at),
                    ts(&record.ended_at),
                    record.duration_ms,
                    record.output,
                    record.error,
                    record.status.as_str(),
                    record.success as i32,
                ],
            )
            .map_err(db("Append run"))?;
        Ok(())
    }

    /// Most recent runs first, optionally for one task.
    pub fn query_runs(&self, task_id: Option<&str>, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.lock()?;
        let limit = limit as i64;
        let rows = match task_id {
            Some(task_id) => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM run_records WHERE task_id = ?1
                         ORDER BY started_at DESC, seq DESC LIMIT ?2"
                    ))
                    .map_err(db("Query runs"))?;
                let rows = stmt
                    .query_map(params![task_id, limit], RunRow::from_row)
                    .map_err(db("Query runs"))?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
            None => {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {RUN_COLUMNS} FROM run_records
                         ORDER BY started_at DESC, seq DESC LIMIT ?1"
                    ))
                    .map_err(db("Query runs"))?;
                let rows = stmt
                    .query_map(params![limit], RunRow::from_row)
                    .map_err(db("Query runs"))?
                    .collect::<rusqlite::Result<Vec<_>>>();
                rows
            }
        }
        .map_err(db("Query runs"))?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    pub fn run_counts(&self) -> Result<RunCounts> {
        self.lock()?
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(success), 0) FROM run_records",
                [],
                |r| {
                    let total = r.get::<_, i64>(0)? as u64;
                    let success = r.get::<_, i64>(1)? as u64;
                    Ok(RunCounts {
                        total,
                        success,
                        failed: total - success,
                    })
                },
            )
            .map_err(db("Count runs"))
    }

    // ─── Notifiers ────────────────────────────────────────────

    pub fn save_notifier(&self, notifier: &NotifierConfig) -> Result<()> {
        let channel = serde_json::to_string(&notifier.channel)?;
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO notifiers (id, name, enabled, channel, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    notifier.id,
                    notifier.name,
                    notifier.enabled as i32,
                    channel,
                    ts(&notifier.created_at),
                    ts(&notifier.updated_at),
                ],
            )
            .map_err(db("Save notifier"))?;
        Ok(())
    }

    pub fn get_notifier(&self, id: &str) -> Result<Option<NotifierConfig>> {
        let row = self
            .lock()?
            .query_row(
                "SELECT id, name, enabled, channel, created_at, updated_at FROM notifiers WHERE id = ?1",
                [id],
                NotifierRow::from_row,
            )
            .optional()
            .map_err(db("Get notifier"))?;
        row.map(NotifierRow::into_notifier).transpose()
    }

    pub fn list_notifiers(&self) -> Result<Vec<NotifierConfig>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, enabled, channel, created_at, updated_at FROM notifiers
                 ORDER BY created_at, rowid",
            )
            .map_err(db("List notifiers"))?;
        let rows = stmt
            .query_map([], NotifierRow::from_row)
            .map_err(db("List notifiers"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("List notifiers"))?;
        rows.into_iter().map(NotifierRow::into_notifier).collect()
    }

    pub fn enabled_notifiers(&self) -> Result<Vec<NotifierConfig>> {
        Ok(self
            .list_notifiers()?
            .into_iter()
            .filter(|n| n.enabled)
            .collect())
    }

    pub fn delete_notifier(&self, id: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM notifiers WHERE id = ?1", [id])
            .map_err(db("Delete notifier"))?;
        Ok(n > 0)
    }

    // ─── Environment Variables ───────────────────────────────

    /// All global variables, sorted by key.
    pub fn env_vars(&self) -> Result<Vec<(String, String)>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM env_vars ORDER BY key")
            .map_err(db("List env"))?;
        let vars = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(db("List env"))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db("List env"))?;
        Ok(vars)
    }

    pub fn set_env_var(&self, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.contains('=') || key.contains('\0') {
            return Err(TempoError::Validation(format!(
                "invalid environment variable name '{key}'"
            )));
        }
        if value.contains('\0') {
            return Err(TempoError::Validation(format!(
                "environment variable '{key}' contains a NUL byte"
            )));
        }
        self.lock()?
            .execute(
                "INSERT OR REPLACE INTO env_vars (key, value, updated_at) VALUES (?1, ?2, ?3)",
                params![key, value, ts(&Utc::now())],
            )
            .map_err(db("Set env"))?;
        Ok(())
    }

    pub fn delete_env_var(&self, key: &str) -> Result<bool> {
        let n = self
            .lock()?
            .execute("DELETE FROM env_vars WHERE key = ?1", [key])
            .map_err(db("Delete env"))?;
        Ok(n > 0)
    }
}

// ─── Row mapping ──────────────────────────────────────────────

const SCRIPT_COLUMNS: &str =
    "id, name, description, kind, source, tags, timeout_secs, created_at, updated_at, last_run_at";
const TASK_COLUMNS: &str = "id, name, description, script_id, schedule, cron, status, created_at, \
     updated_at, last_run_at, next_run_at";
const RUN_COLUMNS: &str =
    "id, task_id, task_name, started_at, ended_at, duration_ms, output, error, status, success";

struct ScriptRow {
    id: String,
    name: String,
    description: String,
    kind: String,
    source: String,
    tags: String,
    timeout_secs: Option<i64>,
    created_at: String,
    updated_at: String,
    last_run_at: Option<String>,
}

impl ScriptRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            kind: row.get(3)?,
            source: row.get(4)?,
            tags: row.get(5)?,
            timeout_secs: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_run_at: row.get(9)?,
        })
    }

    fn into_script(self) -> Result<Script> {
        let kind: ScriptKind = self.kind.parse()?;
        let source: ScriptSource = serde_json::from_str(&self.source)?;
        Ok(Script {
            id: self.id,
            name: self.name,
            description: self.description,
            kind,
            source,
            tags: serde_json::from_str(&self.tags)?,
            timeout_secs: self.timeout_secs.map(|t| t as u64),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct TaskRow {
    id: String,
    name: String,
    description: String,
    script_id: String,
    schedule: String,
    cron: String,
    status: String,
    created_at: String,
    updated_at: String,
    last_run_at: Option<String>,
    next_run_at: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            script_id: row.get(3)?,
            schedule: row.get(4)?,
            cron: row.get(5)?,
            status: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            last_run_at: row.get(9)?,
            next_run_at: row.get(10)?,
        })
    }

    fn into_task(self) -> Result<Task> {
        let schedule: Schedule = serde_json::from_str(&self.schedule)?;
        let status = TaskStatus::parse(&self.status).ok_or_else(|| {
            TempoError::Database(format!("task {} has unknown status '{}'", self.id, self.status))
        })?;
        Ok(Task {
            id: self.id,
            name: self.name,
            description: self.description,
            script_id: self.script_id,
            schedule,
            cron: self.cron,
            status,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            last_run_at: self.last_run_at.as_deref().map(parse_ts).transpose()?,
            next_run_at: self.next_run_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

struct RunRow {
    id: String,
    task_id: Option<String>,
    task_name: String,
    started_at: String,
    ended_at: String,
    duration_ms: i64,
    output: String,
    error: String,
    status: String,
    success: bool,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            task_name: row.get(2)?,
            started_at: row.get(3)?,
            ended_at: row.get(4)?,
            duration_ms: row.get(5)?,
            output: row.get(6)?,
            error: row.get(7)?,
            status: row.get(8)?,
            success: row.get::<_, i32>(9)? != 0,
        })
    }

    fn into_record(self) -> Result<RunRecord> {
        let status = RunStatus::parse(&self.status).ok_or_else(|| {
            TempoError::Database(format!("run {} has unknown status '{}'", self.id, self.status))
        })?;
        Ok(RunRecord {
            id: self.id,
            task_id: self.task_id,
            task_name: self.task_name,
            started_at: parse_ts(&self.started_at)?,
            ended_at: parse_ts(&self.ended_at)?,
            duration_ms: self.duration_ms,
            output: self.output,
            error: self.error,
            status,
            success: self.success,
        })
    }
}

struct NotifierRow {
    id: String,
    name: String,
    enabled: bool,
    channel: String,
    created_at: String,
    updated_at: String,
}

impl NotifierRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            enabled: row.get::<_, i32>(2)? != 0,
            channel: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_notifier(self) -> Result<NotifierConfig> {
        let channel: ChannelConfig = serde_json::from_str(&self.channel)?;
        Ok(NotifierConfig {
            id: self.id,
            name: self.name,
            enabled: self.enabled,
            channel,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

/// Current time at the precision timestamps are stored with.
pub(crate) fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
fn ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| TempoError::Database(format!("bad timestamp '{s}': {e}")))
}

fn db(context: &'static str) -> impl Fn(rusqlite::Error) -> TempoError {
    move |e| TempoError::Database(format!("{context}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RunOutcome;
    use crate::scripts::ScriptDraft;
    use crate::tasks::TaskDraft;
    use chrono::Duration;

    fn run(task_id: Option<&str>, started_at: DateTime<Utc>, outcome: RunOutcome) -> RunRecord {
        RunRecord::new(
            task_id.map(String::from),
            "job",
            started_at,
            started_at + Duration::milliseconds(10),
            outcome,
        )
    }

    #[test]
    fn test_script_roundtrip() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut draft = ScriptDraft::inline("hello", ScriptKind::Python, "print('hi')");
        draft.tags = vec!["demo".into()];
        draft.timeout_secs = Some(5);
        let script = Script::from_draft(draft).unwrap();
        db.save_script(&script).unwrap();

        let loaded = db.get_script(&script.id).unwrap().unwrap();
        assert_eq!(loaded.name, "hello");
        assert_eq!(loaded.kind, ScriptKind::Python);
        assert_eq!(loaded.source, script.source);
        assert_eq!(loaded.tags, vec!["demo"]);
        assert_eq!(loaded.timeout_secs, Some(5));
        assert_eq!(loaded.created_at, script.created_at);

        let at = Utc::now();
        db.mark_script_run(&script.id, at).unwrap();
        let loaded = db.get_script(&script.id).unwrap().unwrap();
        assert!(loaded.last_run_at.is_some());

        assert!(db.delete_script(&script.id).unwrap());
        assert!(!db.delete_script(&script.id).unwrap());
        assert!(db.get_script(&script.id).unwrap().is_none());
    }

    #[test]
    fn test_task_roundtrip_keeps_cron() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let task = Task::from_draft(TaskDraft::new(
            "weekly report",
            "s1",
            Schedule::Weekly {
                hour: 9,
                minute: 30,
                weekdays: vec![1, 5],
            },
        ))
        .unwrap();
        db.save_task(&task).unwrap();

        let loaded = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(loaded.schedule, task.schedule);
        assert_eq!(loaded.cron, task.cron);
        assert_eq!(loaded.schedule.to_cron().unwrap(), loaded.cron);
        assert_eq!(loaded.status, TaskStatus::Inactive);
        assert_eq!(db.tasks_using_script("s1").unwrap(), 1);
    }

    #[test]
    fn test_query_runs_newest_first_with_limit() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let base = Utc::now();
        for i in 0..5 {
            let rec = run(
                Some("a"),
                base + Duration::seconds(i),
                RunOutcome::success(format!("run {i}")),
            );
            db.append_run(&rec).unwrap();
        }
        db.append_run(&run(
            Some("b"),
            base + Duration::seconds(100),
            RunOutcome::failed(String::new(), "boom".into()),
        ))
        .unwrap();
        db.append_run(&run(None, base + Duration::seconds(50), RunOutcome::success("x".into())))
            .unwrap();

        let runs = db.query_runs(Some("a"), 3).unwrap();
        let outputs: Vec<&str> = runs.iter().map(|r| r.output.as_str()).collect();
        assert_eq!(outputs, vec!["run 4", "run 3", "run 2"]);

        let all = db.query_runs(None, DEFAULT_LOG_LIMIT).unwrap();
        assert_eq!(all.len(), 7);
        assert_eq!(all[0].task_id.as_deref(), Some("b"));
        assert!(all[1].task_id.is_none());
        assert!(all.windows(2).all(|w| w[0].started_at >= w[1].started_at));

        let counts = db.run_counts().unwrap();
        assert_eq!(counts.total, 7);
        assert_eq!(counts.success, 6);
        assert_eq!(counts.failed, 1);
    }

    #[test]
    fn test_same_start_time_orders_by_insertion() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let t = Utc::now();
        let first = run(Some("a"), t, RunOutcome::success("first".into()));
        let second = run(Some("a"), t, RunOutcome::success("second".into()));
        db.append_run(&first).unwrap();
        db.append_run(&second).unwrap();
        let runs = db.query_runs(Some("a"), 10).unwrap();
        assert_eq!(runs[0].output, "second");
        assert_eq!(runs[1], first);
    }

    #[test]
    fn test_notifier_crud() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut n = NotifierConfig::new(
            "team",
            ChannelConfig::Dingtalk {
                webhook: "https://oapi.dingtalk.com/robot/send?access_token=x".into(),
            },
        )
        .unwrap();
        db.save_notifier(&n).unwrap();
        assert_eq!(db.enabled_notifiers().unwrap().len(), 1);

        n.enabled = false;
        db.save_notifier(&n).unwrap();
        assert!(db.enabled_notifiers().unwrap().is_empty());
        assert_eq!(db.list_notifiers().unwrap().len(), 1);
        assert_eq!(db.get_notifier(&n.id).unwrap().unwrap().channel, n.channel);
        assert!(db.delete_notifier(&n.id).unwrap());
    }

    #[test]
    fn test_env_vars() {
        let db = SchedulerDb::open_in_memory().unwrap();
        db.set_env_var("B", "2").unwrap();
        db.set_env_var("A", "1").unwrap();
        db.set_env_var("A", "3").unwrap();
        assert_eq!(
            db.env_vars().unwrap(),
            vec![("A".to_string(), "3".to_string()), ("B".to_string(), "2".to_string())]
        );
        assert!(db.set_env_var("", "x").is_err());
        assert!(db.set_env_var("A=B", "x").is_err());
        assert!(db.delete_env_var("A").unwrap());
        assert_eq!(db.env_vars().unwrap().len(), 1);
    }

    #[test]
    fn test_file_db_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tempo.db");
        {
            let db = SchedulerDb::open(&path).unwrap();
            db.append_run(&run(Some("a"), Utc::now(), RunOutcome::success("ok".into())))
                .unwrap();
        }
        let db = SchedulerDb::open(&path).unwrap();
        assert_eq!(db.run_counts().unwrap().total, 1);
    }

    #[test]
    fn test_kind_change_refused_once_run() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut script =
            Script::from_draft(ScriptDraft::inline("a", ScriptKind::Shell, "echo")).unwrap();
        db.save_script(&script).unwrap();
        db.mark_script_run(&script.id, Utc::now()).unwrap();

        // Stale copy that never saw the run
        script.kind = ScriptKind::Python;
        script.source = ScriptSource::Inline {
            code: "print(1)".into(),
        };
        assert!(matches!(
            db.update_script(&script),
            Err(TempoError::Validation(_))
        ));
        assert_eq!(
            db.get_script(&script.id).unwrap().unwrap().kind,
            ScriptKind::Shell
        );

        script.id = "missing".into();
        assert!(matches!(
            db.update_script(&script),
            Err(TempoError::NotFound { .. })
        ));
    }

    #[test]
    fn test_created_entities_equal_stored() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let script =
            Script::from_draft(ScriptDraft::inline("a", ScriptKind::Shell, "echo")).unwrap();
        db.save_script(&script).unwrap();
        let stored = db.get_script(&script.id).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            serde_json::to_value(&script).unwrap()
        );

        let task = Task::from_draft(TaskDraft::new(
            "t",
            &script.id,
            Schedule::Daily { hour: 1, minute: 0 },
        ))
        .unwrap();
        db.save_task(&task).unwrap();
        let stored = db.get_task(&task.id).unwrap().unwrap();
        assert_eq!(
            serde_json::to_value(&stored).unwrap(),
            serde_json::to_value(&task).unwrap()
        );
    }

    #[test]
    fn test_run_bookkeeping_never_resurrects_tasks() {
        let db = SchedulerDb::open_in_memory().unwrap();
        let mut task = Task::from_draft(
            TaskDraft::new("t", "s1", Schedule::Daily { hour: 1, minute: 0 }).active(),
        )
        .unwrap();
        db.save_task(&task).unwrap();

        let next = Utc::now() + Duration::hours(1);
        assert!(db.set_task_next_run(&task.id, Some(next)).unwrap());
        assert!(db.get_task(&task.id).unwrap().unwrap().next_run_at.is_some());

        // Deactivated elsewhere: a late next-run write is ignored
        task.status = TaskStatus::Inactive;
        task.next_run_at = None;
        db.save_task(&task).unwrap();
        assert!(db.set_task_next_run(&task.id, Some(next)).unwrap());
        assert!(db.get_task(&task.id).unwrap().unwrap().next_run_at.is_none());

        assert!(db.delete_task(&task.id).unwrap());
        assert!(!db.set_task_last_run(&task.id, Utc::now()).unwrap());
        assert!(!db.set_task_next_run(&task.id, Some(next)).unwrap());
        assert!(db.get_task(&task.id).unwrap().is_none());
    }
}
