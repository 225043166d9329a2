//! Notification dispatch: actually sends run summaries to configured channels.
//! Supports: DingTalk robot, WeCom robot, Lark/Feishu bot (optionally signed),
//! generic HTTP webhook.

use async_trait::async_trait;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;

use crate::notify::{self, ChannelConfig, NotifierConfig};
use crate::records::RunRecord;
use tempo_core::config::NotifyConfig;
use tempo_core::error::{Result, TempoError};

/// Receives every completed run that should be announced.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver `record` to each target. Failures are handled internally.
    async fn notify(&self, record: &RunRecord, targets: &[NotifierConfig]);
}

/// HTTP delivery to chat robots and webhooks.
pub struct NotifyDispatcher {
    client: reqwest::Client,
    config: NotifyConfig,
}

impl NotifyDispatcher {
    pub fn new(config: NotifyConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Send one record to one channel.
    pub async fn dispatch(&self, record: &RunRecord, channel: &ChannelConfig) -> Result<()> {
        let payload = build_payload(record, channel, &self.config)?;
        let mut req = self
            .client
            .post(channel.webhook())
            .json(&payload)
            .timeout(Duration::from_secs(self.config.timeout_secs));

        if let ChannelConfig::Lark {
            secret: Some(secret),
            ..
        } = channel
            && !secret.is_empty()
        {
            let timestamp = chrono::Utc::now().timestamp();
            let sign = lark_sign(timestamp, secret)?;
            req = req.query(&[("timestamp", timestamp.to_string()), ("sign", sign)]);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TempoError::Notify(format!("{} send failed: {e}", channel.kind())))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(TempoError::Notify(format!(
                "{} error {status}: {body}",
                channel.kind()
            )))
        }
    }
}

#[async_trait]
impl Notifier for NotifyDispatcher {
    async fn notify(&self, record: &RunRecord, targets: &[NotifierConfig]) {
        let sends = targets.iter().filter(|t| t.enabled).map(|target| async move {
            (target, self.dispatch(record, &target.channel).await)
        });
        for (target, result) in futures::future::join_all(sends).await {
            match result {
                Ok(()) => tracing::info!(
                    "✅ {} notification sent via '{}': {}",
                    target.channel.kind(),
                    target.name,
                    record.task_name
                ),
                Err(e) => tracing::warn!("⚠️ Notifier '{}' failed: {e}", target.name),
            }
        }
    }
}

/// JSON body for a channel.
pub fn build_payload(
    record: &RunRecord,
    channel: &ChannelConfig,
    config: &NotifyConfig,
) -> Result<serde_json::Value> {
    let text = || format!("{}\n{}", notify::title(record), notify::summarize(record, config));
    Ok(match channel {
        ChannelConfig::Dingtalk { .. } | ChannelConfig::Wechat { .. } => serde_json::json!({
            "msgtype": "text",
            "text": { "content": text() }
        }),
        ChannelConfig::Lark { .. } => serde_json::json!({
            "msg_type": "text",
            "content": { "text": text() }
        }),
        ChannelConfig::Webhook { .. } => serde_json::to_value(record)?,
    })
}

/// Lark signature: HMAC-SHA256 keyed by "{timestamp}\n{secret}" over an
/// empty message, base64-encoded.
pub fn lark_sign(timestamp: i64, secret: &str) -> Result<String> {
    let key = format!("{timestamp}\n{secret}");
    let mut mac = Hmac::<Sha256>::new_from_slice(key.as_bytes())
        .map_err(|e| TempoError::Notify(format!("Lark sign: {e}")))?;
    mac.update(b"");
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::RunOutcome;
    use chrono::Utc;

    fn record(output: &str) -> RunRecord {
        let now = Utc::now();
        RunRecord::new(
            Some("t1".into()),
            "nightly",
            now,
            now,
            RunOutcome::success(output.into()),
        )
    }

    #[test]
    fn test_dingtalk_payload() {
        let rec = record("[NOTIFY] 3 files synced");
        let channel = ChannelConfig::Dingtalk {
            webhook: "https://oapi.dingtalk.com/robot/send".into(),
        };
        let body = build_payload(&rec, &channel, &NotifyConfig::default()).unwrap();
        assert_eq!(body["msgtype"], "text");
        let content = body["text"]["content"].as_str().unwrap();
        assert!(content.contains("nightly"));
        assert!(content.ends_with("3 files synced"));
    }

    #[test]
    fn test_lark_payload_shape() {
        let channel = ChannelConfig::Lark {
            webhook: "https://open.feishu.cn/open-apis/bot/v2/hook/x".into(),
            secret: None,
        };
        let body = build_payload(&record("ok"), &channel, &NotifyConfig::default()).unwrap();
        assert_eq!(body["msg_type"], "text");
        assert!(body["content"]["text"].as_str().unwrap().contains("nightly"));
    }

    #[test]
    fn test_webhook_payload_is_full_record() {
        let rec = record("hello");
        let channel = ChannelConfig::Webhook {
            webhook: "https://example.com/hook".into(),
        };
        let body = build_payload(&rec, &channel, &NotifyConfig::default()).unwrap();
        assert_eq!(body["id"], rec.id.as_str());
        assert_eq!(body["output"], "hello");
        assert_eq!(body["success"], true);
        assert_eq!(body["status"], "success");
    }

    #[test]
    fn test_lark_sign_is_deterministic() {
        let a = lark_sign(1_700_000_000, "secret").unwrap();
        let b = lark_sign(1_700_000_000, "secret").unwrap();
        assert_eq!(a, b);
        // 32-byte digest -> 44 base64 chars
        assert_eq!(a.len(), 44);
        assert_ne!(a, lark_sign(1_700_000_001, "secret").unwrap());
    }

    #[tokio::test]
    async fn test_unreachable_webhook_is_error() {
        let d = NotifyDispatcher::new(NotifyConfig {
            timeout_secs: 2,
            ..NotifyConfig::default()
        });
        let channel = ChannelConfig::Webhook {
            webhook: "http://127.0.0.1:1/hook".into(),
        };
        let err = d.dispatch(&record("x"), &channel).await.unwrap_err();
        assert!(matches!(err, TempoError::Notify(_)));
    }
}
