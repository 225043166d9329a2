//! # Tempo Scheduler
//!
//! Runs user scripts (Python, Node.js, shell) on daily, weekly, monthly or
//! cron schedules, records every run and pushes summaries to chat robots.
//!
//! ## Design Principles
//! - SQLite persistence: scripts, tasks, history and settings survive restarts
//! - One loop owns task state; runs execute on a bounded worker pool
//! - A task never overlaps itself
//! - Missed runs while stopped are skipped, not replayed
//!
//! ## Architecture
//! ```text
//! SchedulerHandle ──commands──▶ SchedulerEngine (tokio select loop)
//!                                 ├── tick: due tasks → WorkerPool (FIFO, capped)
//!                                 ├── ProcessRunner: interpreter + timeout + tail capture
//!                                 ├── SchedulerDb: run_records, tasks.last/next_run
//!                                 └── NotifyDispatcher
//!                                       ├── DingTalk robot
//!                                       ├── WeCom robot
//!                                       ├── Lark/Feishu bot (signed)
//!                                       └── Webhook (HTTP POST, full record)
//! ```

pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod handle;
pub mod notify;
pub mod persistence;
pub mod pool;
pub mod records;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod scripts;
pub mod tasks;

pub use cron::CronExpr;
pub use dispatch::{Notifier, NotifyDispatcher};
pub use engine::{SchedulerEngine, SchedulerStats};
pub use handle::{PendingRun, SchedulerHandle};
pub use notify::{ChannelConfig, NotifierConfig};
pub use persistence::SchedulerDb;
pub use pool::{PoolStats, WorkerPool};
pub use records::{RunCounts, RunOutcome, RunRecord, RunStatus};
pub use registry::ScriptRegistry;
pub use runner::{ProcessRunner, RunEnv, ScriptRunner};
pub use schedule::Schedule;
pub use scripts::{Script, ScriptDraft, ScriptKind, ScriptSource};
pub use tasks::{Task, TaskDraft, TaskStatus};
