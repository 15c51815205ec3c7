//! Inbound Telegram updates turned into task intake.

use serde_json::{json, Value};

use mctl_types::{NewTask, OriginChannel, TaskOrigin};

const TITLE_LIMIT: usize = 80;

/// The parts of a Telegram update that matter for intake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub update_id: i64,
    pub text: String,
    /// Numeric Telegram user id, compared against the trusted identities.
    pub sender_id: Option<String>,
    pub chat_id: Option<String>,
    /// `@username`, then first name, then the numeric id.
    pub sender: String,
}

/// Returns `None` for updates without a text message (joins, stickers, callbacks).
pub fn parse_telegram_update(update: &Value) -> Option<InboundMessage> {
    let msg = update
        .get("message")
        .or_else(|| update.get("edited_message"))?;
    let text = msg.get("text").and_then(Value::as_str)?.trim();
    if text.is_empty() {
        return None;
    }

    let sender_id = msg["from"]["id"].as_i64().map(|id| id.to_string());
    let chat_id = msg["chat"]["id"].as_i64().map(|id| id.to_string());
    let sender = msg["from"]["username"]
        .as_str()
        .map(|u| format!("@{u}"))
        .or_else(|| msg["from"]["first_name"].as_str().map(str::to_string))
        .or_else(|| sender_id.clone())
        .unwrap_or_else(|| "unknown".to_string());

    Some(InboundMessage {
        update_id: update["update_id"].as_i64().unwrap_or(0),
        text: text.to_string(),
        sender_id,
        chat_id,
        sender,
    })
}

impl InboundMessage {
    pub fn into_new_task(self, tenant_id: &str) -> NewTask {
        let first_line = self.text.lines().next().unwrap_or_default().trim();
        let title = if first_line.chars().count() > TITLE_LIMIT {
            let cut = first_line.chars().take(TITLE_LIMIT).collect::<String>();
            format!("{}...", cut.trim_end())
        } else {
            first_line.to_string()
        };
        let mut input = NewTask::new(title, self.text, tenant_id);
        input.origin = TaskOrigin {
            channel: OriginChannel::Telegram,
            sender_id: self.sender_id,
            chat_id: self.chat_id,
            metadata: Some(json!({
                "update_id": self.update_id,
                "sender": self.sender,
            })),
        };
        input
    }
}
