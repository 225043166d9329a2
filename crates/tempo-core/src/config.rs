//! Tempo configuration system.
//!
//! Everything is optional in `config.toml`; missing sections fall back to the
//! defaults below so a fresh install runs without any file at all.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, TempoError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TempoConfig {
    /// Directory holding `tempo.db` and the `scripts/` working directory.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_data_dir() -> String {
    "~/.tempo".into()
}

impl Default for TempoConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            scheduler: SchedulerConfig::default(),
            runner: RunnerConfig::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl TempoConfig {
    /// Load config from the default path (~/.tempo/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| TempoError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| TempoError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.max_concurrent == 0 {
            return Err(TempoError::Config(
                "scheduler.max_concurrent must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(TempoError::Config(
                "scheduler.tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.runner.timeout_secs == 0 {
            return Err(TempoError::Config("runner.timeout_secs must be at least 1".into()));
        }
        if self.runner.max_output_bytes == 0 {
            return Err(TempoError::Config(
                "runner.max_output_bytes must be at least 1".into(),
            ));
        }
        if self.notify.marker.trim().is_empty() {
            return Err(TempoError::Config("notify.marker must not be empty".into()));
        }
        Ok(())
    }

    /// Resolved data directory with `~` expanded.
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.data_dir).to_string())
    }

    /// SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_path().join("tempo.db")
    }

    /// Working directory for script runs and inline-source temp files.
    pub fn scripts_dir(&self) -> PathBuf {
        self.data_path().join("scripts")
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Tempo home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".tempo")
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the loop re-checks for due tasks.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Maximum number of scripts running at once.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_max_concurrent() -> usize {
    4
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Process runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Bytes retained per stream (the tail is kept).
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Ambient variables passed through to child processes.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
    #[serde(default)]
    pub interpreters: InterpreterConfig,
}

fn default_timeout_secs() -> u64 {
    300
}
fn default_max_output_bytes() -> usize {
    64 * 1024
}
fn default_inherit_env() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "USER",
        "LOGNAME",
        "LANG",
        "LC_ALL",
        "TZ",
        "TMPDIR",
        "SHELL",
        "SYSTEMROOT",
        "TEMP",
        "TMP",
        "USERPROFILE",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            inherit_env: default_inherit_env(),
            interpreters: InterpreterConfig::default(),
        }
    }
}

/// Interpreter program per script kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterpreterConfig {
    #[serde(default = "default_python")]
    pub python: String,
    #[serde(default = "default_nodejs")]
    pub nodejs: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_python() -> String {
    "python3".into()
}
fn default_nodejs() -> String {
    "node".into()
}
fn default_shell() -> String {
    "bash".into()
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            python: default_python(),
            nodejs: default_nodejs(),
            shell: default_shell(),
        }
    }
}

/// Notification formatting and delivery configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Output lines starting with this marker form the notification body.
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Characters of raw output used when no marked lines exist.
    #[serde(default = "default_summary_chars")]
    pub summary_chars: usize,
    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_marker() -> String {
    "[NOTIFY]".into()
}
fn default_summary_chars() -> usize {
    200
}
fn default_notify_timeout_secs() -> u64 {
    10
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            summary_chars: default_summary_chars(),
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TempoConfig::default();
        assert_eq!(config.scheduler.max_concurrent, 4);
        assert_eq!(config.runner.timeout_secs, 300);
        assert_eq!(config.runner.max_output_bytes, 65536);
        assert_eq!(config.notify.marker, "[NOTIFY]");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            data_dir = "/var/lib/tempo"

            [scheduler]
            max_concurrent = 8

            [runner]
            timeout_secs = 60

            [runner.interpreters]
            python = "python3.12"
        "#;

        let config: TempoConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.scheduler.max_concurrent, 8);
        assert_eq!(config.scheduler.tick_interval_ms, 1000);
        assert_eq!(config.runner.timeout_secs, 60);
        assert_eq!(config.runner.interpreters.python, "python3.12");
        assert_eq!(config.runner.interpreters.nodejs, "node");
        assert_eq!(config.db_path(), PathBuf::from("/var/lib/tempo/tempo.db"));
        assert_eq!(config.scripts_dir(), PathBuf::from("/var/lib/tempo/scripts"));
    }

    #[test]
    fn test_config_missing_fields_use_defaults() {
        let config: TempoConfig = toml::from_str("").unwrap();
        assert_eq!(config.data_dir, "~/.tempo");
        assert!(config.runner.inherit_env.contains(&"PATH".to_string()));
        assert_eq!(config.notify.summary_chars, 200);
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = TempoConfig::default();
        config.scheduler.max_concurrent = 0;
        assert!(matches!(config.validate(), Err(TempoError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_blank_marker() {
        let mut config = TempoConfig::default();
        config.notify.marker = "  ".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = TempoConfig::default();
        config.scheduler.max_concurrent = 2;
        std::fs::write(&path, toml::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = TempoConfig::load_from(&path).unwrap();
        assert_eq!(loaded.scheduler.max_concurrent, 2);

        std::fs::write(&path, "[scheduler]\nmax_concurrent = 0\n").unwrap();
        assert!(TempoConfig::load_from(&path).is_err());
    }

    #[test]
    fn test_home_dir() {
        let home = TempoConfig::home_dir();
        assert!(home.to_string_lossy().contains("tempo"));
    }
}
