//! Run records: the immutable outcome of one execution.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Exit code 0.
    Success,
    /// Non-zero exit or killed by a signal.
    Failed,
    /// Killed after exceeding its timeout.
    Timeout,
    /// Could not be run at all (missing script, spawn failure, ...).
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Timeout => "timeout",
            RunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failed" => Some(RunStatus::Failed),
            "timeout" => Some(RunStatus::Timeout),
            "error" => Some(RunStatus::Error),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == RunStatus::Success
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution, as stored in the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    /// `None` for ad-hoc script runs.
    pub task_id: Option<String>,
    /// Captured at run time so history survives renames and deletes.
    pub task_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub output: String,
    pub error: String,
    pub status: RunStatus,
    pub success: bool,
}

impl RunRecord {
    pub fn new(
        task_id: Option<String>,
        task_name: &str,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: RunOutcome,
    ) -> Self {
        // Stored with microsecond precision; keep the in-memory copy identical.
        let started_at = started_at.trunc_subsecs(6);
        let ended_at = ended_at.trunc_subsecs(6).max(started_at);
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_id,
            task_name: task_name.to_string(),
            started_at,
            ended_at,
            duration_ms: (ended_at - started_at).num_milliseconds(),
            output: outcome.output,
            error: outcome.error,
            status: outcome.status,
            success: outcome.status.is_success(),
        }
    }
}

/// What the runner hands back: everything except identity and timing.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub output: String,
    pub error: String,
}

impl RunOutcome {
    pub fn success(output: String) -> Self {
        Self {
            status: RunStatus::Success,
            output,
            error: String::new(),
        }
    }

    pub fn failed(output: String, error: String) -> Self {
        Self {
            status: RunStatus::Failed,
            output,
            error,
        }
    }

    pub fn timeout(output: String, error: String) -> Self {
        Self {
            status: RunStatus::Timeout,
            output,
            error,
        }
    }

    /// Infrastructure failure: nothing ran, or the run could not be observed.
    pub fn error(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Error,
            output: String::new(),
            error: error.into(),
        }
    }
}

/// Aggregate counts across the whole run log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
}
