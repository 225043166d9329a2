//! Notification configs and run summaries.
//! A run's summary is built from its `[NOTIFY]`-marked output lines, falling
//! back to a short excerpt when the script marked nothing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::RunRecord;
use tempo_core::config::NotifyConfig;
use tempo_core::error::{Result, TempoError};

/// Channel-specific delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChannelConfig {
    /// DingTalk group robot.
    Dingtalk { webhook: String },
    /// WeCom group robot.
    Wechat { webhook: String },
    /// Lark / Feishu custom bot, optionally signed.
    Lark {
        webhook: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        secret: Option<String>,
    },
    /// Generic HTTP endpoint receiving the full run record as JSON.
    Webhook { webhook: String },
}

impl ChannelConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelConfig::Dingtalk { .. } => "dingtalk",
            ChannelConfig::Wechat { .. } => "wechat",
            ChannelConfig::Lark { .. } => "lark",
            ChannelConfig::Webhook { .. } => "webhook",
        }
    }

    pub fn webhook(&self) -> &str {
        match self {
            ChannelConfig::Dingtalk { webhook }
            | ChannelConfig::Wechat { webhook }
            | ChannelConfig::Lark { webhook, .. }
            | ChannelConfig::Webhook { webhook } => webhook,
        }
    }
}

/// A configured notification target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    pub channel: ChannelConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl NotifierConfig {
    pub fn new(name: &str, channel: ChannelConfig) -> Result<Self> {
        let now = crate::persistence::now();
        let config = Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.trim().to_string(),
            enabled: true,
            channel,
            created_at: now,
            updated_at: now,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TempoError::Validation("notifier name is required".into()));
        }
        let url = self.channel.webhook();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(TempoError::Validation(format!(
                "notifier '{}' webhook must be an http(s) URL, got '{url}'",
                self.name
            )));
        }
        Ok(())
    }
}

/// Lines starting with `marker` (case-insensitive, leading whitespace
/// ignored), with the marker removed and the rest trimmed.
pub fn extract_marked_lines(output: &str, marker: &str) -> Vec<String> {
    let marker = marker.trim();
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let head = line.get(..marker.len())?;
            if !head.eq_ignore_ascii_case(marker) {
                return None;
            }
            let rest = line[marker.len()..].trim();
            (!rest.is_empty()).then(|| rest.to_string())
        })
        .collect()
}

/// Notification body for a completed run.
pub fn summarize(record: &RunRecord, config: &NotifyConfig) -> String {
    let mut lines = extract_marked_lines(&record.output, &config.marker);
    if lines.is_empty() {
        return default_summary(record, config.summary_chars);
    }
    if !record.success && !record.error.is_empty() {
        lines.push(format!("❌ Error: {}", record.error));
    }
    lines.join("\n")
}

/// Fallback body: status, name, duration, then the error or an excerpt.
pub fn default_summary(record: &RunRecord, max_chars: usize) -> String {
    let status = if record.success {
        "✅ Succeeded"
    } else {
        "❌ Failed"
    };
    let mut text = format!(
        "{status}\nTask: {}\nDuration: {}ms",
        record.task_name, record.duration_ms
    );
    if !record.success && !record.error.is_empty() {
        text.push_str(&format!("\nError: {}", record.error));
    } else if !record.output.is_empty() {
        text.push_str(&format!("\nOutput: {}", excerpt(&record.output, max_chars)));
    }
    text
}

fn excerpt(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Title line used by channels that show one.
pub fn title(record: &RunRecord) -> String {
    let icon = if record.success { "✅" } else { "❌" };
    format!("{icon} {} [{}]", record.task_name, record.status)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{RunOutcome, RunStatus};

    fn record(output: &str, outcome: RunOutcome) -> RunRecord {
        let now = Utc::now();
        let mut outcome = outcome;
        outcome.output = output.to_string();
        RunRecord::new(Some("t".into()), "backup", now, now, outcome)
    }

    #[test]
    fn test_extract_marked_lines() {
        let out = "start\n[NOTIFY] hello\n  [notify]   world  \n[NOTIFY]\nnoise [NOTIFY] no\n";
        assert_eq!(extract_marked_lines(out, "[NOTIFY]"), vec!["hello", "world"]);
    }

    #[test]
    fn test_extract_with_trailing_space_marker() {
        let out = "[NOTIFY] hello";
        assert_eq!(extract_marked_lines(out, "[NOTIFY] "), vec!["hello"]);
    }

    #[test]
    fn test_extract_handles_multibyte_lines() {
        let out = "日本語\n[NOTIFY] 完成";
        assert_eq!(extract_marked_lines(out, "[NOTIFY]"), vec!["完成"]);
    }

    #[test]
    fn test_summary_uses_marked_lines() {
        let rec = record("a\n[NOTIFY] disk 91%\nb", RunOutcome::success(String::new()));
        assert_eq!(summarize(&rec, &NotifyConfig::default()), "disk 91%");
    }

    #[test]
    fn test_summary_appends_error_on_failure() {
        let rec = record(
            "[NOTIFY] partial",
            RunOutcome::failed(String::new(), "exited with code 2".into()),
        );
        let text = summarize(&rec, &NotifyConfig::default());
        assert_eq!(text, "partial\n❌ Error: exited with code 2");
    }

    #[test]
    fn test_default_summary_truncates_output() {
        let long = "x".repeat(500);
        let rec = record(&long, RunOutcome::success(String::new()));
        let text = summarize(&rec, &NotifyConfig::default());
        assert!(text.starts_with("✅ Succeeded\nTask: backup"));
        assert!(text.ends_with(&format!("{}...", "x".repeat(200))));
    }

    #[test]
    fn test_default_summary_shows_error() {
        let rec = record("", RunOutcome::timeout(String::new(), "timed out after 2s".into()));
        assert_eq!(rec.status, RunStatus::Timeout);
        let text = default_summary(&rec, 200);
        assert!(text.contains("Error: timed out after 2s"));
    }

    #[test]
    fn test_notifier_validation() {
        assert!(
            NotifierConfig::new(
                "ops",
                ChannelConfig::Webhook {
                    webhook: "ftp://x".into()
                }
            )
            .is_err()
        );
        let n = NotifierConfig::new(
            "ops",
            ChannelConfig::Lark {
                webhook: "https://open.feishu.cn/hook/abc".into(),
                secret: Some("s".into()),
            },
        )
        .unwrap();
        assert!(n.enabled);
        assert_eq!(n.channel.kind(), "lark");
    }

    #[test]
    fn test_channel_serde_shape() {
        let c: ChannelConfig =
            serde_json::from_str(r#"{"type":"dingtalk","webhook":"https://x"}"#).unwrap();
        assert_eq!(
            c,
            ChannelConfig::Dingtalk {
                webhook: "https://x".into()
            }
        );
    }
}
