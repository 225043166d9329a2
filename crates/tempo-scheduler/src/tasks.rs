//! Task definitions: a schedule bound to a script.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schedule::Schedule;
use tempo_core::error::{Result, TempoError};

/// A scheduled task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task ID.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Script to run (weak reference into the registry).
    pub script_id: String,
    pub schedule: Schedule,
    /// Derived from `schedule`; regenerated on every change.
    pub cron: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Only meaningful while active.
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Active,
    #[default]
    Inactive,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Active => "active",
            TaskStatus::Inactive => "inactive",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(TaskStatus::Active),
            "inactive" => Some(TaskStatus::Inactive),
            _ => None,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied fields for creating or updating a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub script_id: String,
    pub schedule: Schedule,
    /// New tasks start inactive unless asked otherwise.
    #[serde(default)]
    pub status: TaskStatus,
}

impl TaskDraft {
    pub fn new(name: &str, script_id: &str, schedule: Schedule) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            script_id: script_id.to_string(),
            schedule,
            status: TaskStatus::Inactive,
        }
    }

    pub fn active(mut self) -> Self {
        self.status = TaskStatus::Active;
        self
    }

    /// Field-level checks; the script reference is checked by the caller.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TempoError::Validation("task name is required".into()));
        }
        if self.script_id.trim().is_empty() {
            return Err(TempoError::Validation("task script_id is required".into()));
        }
        self.schedule.validate()
    }
}

impl Task {
    /// Build a task from a validated draft. `next_run_at` is filled by the loop.
    pub fn from_draft(draft: TaskDraft) -> Result<Self> {
        draft.validate()?;
        let cron = draft.schedule.to_cron()?;
        let now = crate::persistence::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            script_id: draft.script_id,
            schedule: draft.schedule,
            cron,
            status: draft.status,
            created_at: now,
            updated_at: now,
            last_run_at: None,
            next_run_at: None,
        })
    }

    /// Replace the user-editable fields, regenerating the cron expression.
    pub fn apply(&mut self, draft: TaskDraft) -> Result<()> {
        draft.validate()?;
        self.cron = draft.schedule.to_cron()?;
        self.name = draft.name.trim().to_string();
        self.description = draft.description;
        self.script_id = draft.script_id;
        self.schedule = draft.schedule;
        self.status = draft.status;
        self.updated_at = crate::persistence::now();
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }

    /// Active and past its next run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.next_run_at.is_some_and(|next| next <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily() -> Schedule {
        Schedule::Daily { hour: 8, minute: 0 }
    }

    #[test]
    fn test_new_task_defaults_inactive() {
        let t = Task::from_draft(TaskDraft::new("t", "s1", daily())).unwrap();
        assert_eq!(t.status, TaskStatus::Inactive);
        assert_eq!(t.cron, "0 0 8 * * *");
        assert!(t.next_run_at.is_none());
        assert!(!t.is_due(Utc::now()));
    }

    #[test]
    fn test_apply_regenerates_cron() {
        let mut t = Task::from_draft(TaskDraft::new("t", "s1", daily())).unwrap();
        t.apply(TaskDraft::new(
            "t2",
            "s1",
            Schedule::Monthly {
                hour: 1,
                minute: 2,
                day: 3,
            },
        ))
        .unwrap();
        assert_eq!(t.cron, "0 2 1 3 * *");
        assert_eq!(t.name, "t2");
    }

    #[test]
    fn test_apply_rejects_bad_schedule_without_mutating() {
        let mut t = Task::from_draft(TaskDraft::new("t", "s1", daily())).unwrap();
        let err = t.apply(TaskDraft::new("t", "s1", Schedule::Daily { hour: 99, minute: 0 }));
        assert!(matches!(err, Err(TempoError::InvalidSchedule(_))));
        assert_eq!(t.cron, "0 0 8 * * *");
    }

    #[test]
    fn test_is_due() {
        let mut t = Task::from_draft(TaskDraft::new("t", "s1", daily()).active()).unwrap();
        let now = Utc::now();
        t.next_run_at = Some(now - chrono::Duration::seconds(1));
        assert!(t.is_due(now));
        t.status = TaskStatus::Inactive;
        assert!(!t.is_due(now));
    }

    #[test]
    fn test_draft_status_defaults_when_missing() {
        let d: TaskDraft = serde_json::from_str(
            r#"{"name":"n","script_id":"s","schedule":{"kind":"daily","hour":1,"minute":0}}"#,
        )
        .unwrap();
        assert_eq!(d.status, TaskStatus::Inactive);
    }
}
