//! Script registry: CRUD over script definitions.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::persistence::SchedulerDb;
use crate::scripts::{Script, ScriptDraft};
use tempo_core::error::{Result, TempoError};

/// Validated access to stored scripts.
#[derive(Clone)]
pub struct ScriptRegistry {
    db: Arc<SchedulerDb>,
}

impl ScriptRegistry {
    pub fn new(db: Arc<SchedulerDb>) -> Self {
        Self { db }
    }

    pub fn create(&self, draft: ScriptDraft) -> Result<Script> {
        let script = Script::from_draft(draft)?;
        self.db.save_script(&script)?;
        tracing::info!("📜 Script added: '{}' ({})", script.name, script.id);
        Ok(script)
    }

    pub fn get(&self, id: &str) -> Result<Script> {
        self.db
            .get_script(id)?
            .ok_or_else(|| TempoError::not_found("script", id))
    }

    pub fn find(&self, id: &str) -> Result<Option<Script>> {
        self.db.get_script(id)
    }

    pub fn list(&self) -> Result<Vec<Script>> {
        self.db.list_scripts()
    }

    /// Replace a script's editable fields. Identity, creation time and run
    /// history are kept.
    pub fn update(&self, id: &str, draft: ScriptDraft) -> Result<Script> {
        let mut script = self.get(id)?;
        script.apply(draft)?;
        self.db.update_script(&script)?;
        tracing::info!("📝 Script updated: '{}' ({})", script.name, script.id);
        Ok(script)
    }

    /// Scripts still referenced by tasks cannot be deleted.
    pub fn delete(&self, id: &str) -> Result<()> {
        let users = self.db.tasks_using_script(id)?;
        if users > 0 {
            return Err(TempoError::Validation(format!(
                "script {id} is used by {users} task(s); delete or repoint them first"
            )));
        }
        if !self.db.delete_script(id)? {
            return Err(TempoError::not_found("script", id));
        }
        tracing::info!("🗑️ Script deleted: {id}");
        Ok(())
    }

    pub fn mark_run(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.db.mark_script_run(id, at)
    }
}
