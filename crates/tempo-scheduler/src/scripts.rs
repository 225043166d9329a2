//! Script definitions: what a task runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use tempo_core::error::{Result, TempoError};

/// Interpreter family for a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptKind {
    Python,
    Nodejs,
    Shell,
}

impl ScriptKind {
    /// File extension used when materializing inline source.
    pub fn extension(&self) -> &'static str {
        match self {
            ScriptKind::Python => "py",
            ScriptKind::Nodejs => "js",
            ScriptKind::Shell => "sh",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptKind::Python => "python",
            ScriptKind::Nodejs => "nodejs",
            ScriptKind::Shell => "shell",
        }
    }
}

impl fmt::Display for ScriptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptKind {
    type Err = TempoError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "py" | "python3" => Ok(ScriptKind::Python),
            "nodejs" | "node" | "js" | "javascript" => Ok(ScriptKind::Nodejs),
            "shell" | "sh" | "bash" => Ok(ScriptKind::Shell),
            other => Err(TempoError::Validation(format!(
                "unknown script type '{other}' (expected python, nodejs or shell)"
            ))),
        }
    }
}

/// Where the script's code lives. Exactly one form exists per script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ScriptSource {
    Path { path: String },
    Inline { code: String },
}

impl ScriptSource {
    pub fn is_inline(&self) -> bool {
        matches!(self, ScriptSource::Inline { .. })
    }
}

/// A registered script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Script {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ScriptKind,
    #[serde(flatten)]
    pub source: ScriptSource,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Overrides the runner's default timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Caller-supplied fields for creating or updating a script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptDraft {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub kind: ScriptKind,
    #[serde(flatten)]
    pub source: ScriptSource,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ScriptDraft {
    pub fn inline(name: &str, kind: ScriptKind, code: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            kind,
            source: ScriptSource::Inline {
                code: code.to_string(),
            },
            tags: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn path(name: &str, kind: ScriptKind, path: &str) -> Self {
        Self {
            name: name.to_string(),
            description: String::new(),
            kind,
            source: ScriptSource::Path {
                path: path.to_string(),
            },
            tags: Vec::new(),
            timeout_secs: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TempoError::Validation("script name is required".into()));
        }
        match &self.source {
            ScriptSource::Path { path } if path.trim().is_empty() => {
                return Err(TempoError::Validation("script path is empty".into()));
            }
            ScriptSource::Inline { code } if code.trim().is_empty() => {
                return Err(TempoError::Validation("script code is empty".into()));
            }
            _ => {}
        }
        if self.timeout_secs == Some(0) {
            return Err(TempoError::Validation(
                "script timeout must be at least 1 second".into(),
            ));
        }
        Ok(())
    }
}

impl Script {
    /// Build a new script from a validated draft.
    pub fn from_draft(draft: ScriptDraft) -> Result<Self> {
        draft.validate()?;
        let now = crate::persistence::now();
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: draft.name.trim().to_string(),
            description: draft.description,
            kind: draft.kind,
            source: draft.source,
            tags: draft.tags,
            timeout_secs: draft.timeout_secs,
            created_at: now,
            updated_at: now,
            last_run_at: None,
        })
    }

    /// Apply a draft, keeping identity and run history.
    /// The interpreter kind is frozen once the script has run.
    pub fn apply(&mut self, draft: ScriptDraft) -> Result<()> {
        draft.validate()?;
        if self.last_run_at.is_some() && draft.kind != self.kind {
            return Err(TempoError::Validation(format!(
                "script '{}' has run history; its type cannot change from {} to {}",
                self.name, self.kind, draft.kind
            )));
        }
        self.name = draft.name.trim().to_string();
        self.description = draft.description;
        self.kind = draft.kind;
        self.source = draft.source;
        self.tags = draft.tags;
        self.timeout_secs = draft.timeout_secs;
        self.updated_at = crate::persistence::now();
        Ok(())
    }
}
