//! Outbound human notifications: escalations, BLOCK paging and master-report delivery.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::NotificationConfig;

const MAX_MESSAGE_LEN: usize = 4096;
const TELEGRAM_API: &str = "https://api.telegram.org/bot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Info,
    Urgent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub urgency: Urgency,
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

impl Notification {
    pub fn urgent(title: impl Into<String>, body: impl Into<String>, task_id: &str) -> Self {
        Self {
            urgency: Urgency::Urgent,
            title: title.into(),
            body: body.into(),
            task_id: Some(task_id.to_string()),
        }
    }

    pub fn info(title: impl Into<String>, body: impl Into<String>, task_id: &str) -> Self {
        Self {
            urgency: Urgency::Info,
            title: title.into(),
            body: body.into(),
            task_id: Some(task_id.to_string()),
        }
    }

    pub fn render(&self) -> String {
        let marker = match self.urgency {
            Urgency::Urgent => "🚨 ",
            Urgency::Info => "",
        };
        let mut out = format!("{marker}*{}*", self.title);
        if let Some(task_id) = &self.task_id {
            out.push_str(&format!("\ntask: `{task_id}`"));
        }
        if !self.body.trim().is_empty() {
            out.push_str("\n\n");
            out.push_str(self.body.trim());
        }
        out
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()>;
}

pub fn notifier_from_config(config: &NotificationConfig) -> Arc<dyn Notifier> {
    let token = config
        .telegram_bot_token
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let chat = config
        .telegram_chat_id
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty());
    match (token, chat) {
        (Some(token), Some(chat)) => Arc::new(TelegramNotifier::new(token, chat)),
        _ => Arc::new(LogNotifier),
    }
}

/// Writes notifications to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification.urgency {
            Urgency::Urgent => tracing::warn!(
                task_id = notification.task_id.as_deref().unwrap_or(""),
                "urgent notification: {}",
                notification.title
            ),
            Urgency::Info => tracing::info!(
                task_id = notification.task_id.as_deref().unwrap_or(""),
                "notification: {}",
                notification.title
            ),
        }
        Ok(())
    }
}

pub struct TelegramNotifier {
    bot_token: String,
    chat_id: String,
    client: Client,
}

impl TelegramNotifier {
    pub fn new(bot_token: &str, chat_id: &str) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            client,
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!("{TELEGRAM_API}{}/{method}", self.bot_token)
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        for chunk in split_message(&notification.render()) {
            let body = json!({
                "chat_id": self.chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
            });
            let resp = self
                .client
                .post(self.api_url("sendMessage"))
                .json(&body)
                .send()
                .await?;
            if !resp.status().is_success() {
                let status = resp.status();
                let text = resp.text().await.unwrap_or_default();
                anyhow::bail!("telegram sendMessage failed ({status}): {text}");
            }
        }
        Ok(())
    }
}

/// Splits into chunks of at most 4096 characters, preferring newline boundaries.
pub fn split_message(text: &str) -> Vec<String> {
    let chars = text.chars().collect::<Vec<_>>();
    if chars.len() <= MAX_MESSAGE_LEN {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + MAX_MESSAGE_LEN).min(chars.len());
        let window = &chars[start..end];
        let take = if end < chars.len() {
            window
                .iter()
                .rposition(|c| *c == '\n')
                .map(|p| p + 1)
                .unwrap_or(window.len())
        } else {
            window.len()
        };
        chunks.push(window[..take].iter().collect());
        start += take;
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello"), vec!["hello".to_string()]);
    }

    #[test]
    fn long_messages_split_on_newlines_within_limit() {
        let line = "x".repeat(3000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= MAX_MESSAGE_LEN));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn multibyte_text_without_newlines_splits_by_chars() {
        let text = "é".repeat(MAX_MESSAGE_LEN + 10);
        let chunks = split_message(&text);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].chars().count(), 10);
    }

    #[test]
    fn urgent_render_carries_task_and_marker() {
        let rendered = Notification::urgent("Circuit breaker tripped", "3/3 interrupts", "task_1").render();
        assert!(rendered.starts_with("🚨 *Circuit breaker tripped*"));
        assert!(rendered.contains("task: `task_1`"));
    }

    #[test]
    fn missing_telegram_settings_fall_back_to_log() {
        let notifier = notifier_from_config(&NotificationConfig::default());
        assert_eq!(notifier.name(), "log");
        let notifier = notifier_from_config(&NotificationConfig {
            telegram_bot_token: Some("t".into()),
            telegram_chat_id: Some("42".into()),
        });
        assert_eq!(notifier.name(), "telegram");
    }
}
