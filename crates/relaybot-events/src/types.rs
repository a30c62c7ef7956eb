use serde::{Deserialize, Serialize};

/// Subjects emitted on the bus (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subject {
    BotQr,
    BotConnected,
    BotDisconnected,
    MessageReceived,
    MessageSent,
    SessionCreated,
    SystemLog,
}

/// One published event. `bot_id` is empty for bot-agnostic subjects
/// (currently none, kept for forward compatibility).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub subject: Subject,
    pub bot_id: String,
    pub payload: serde_json::Value,
    pub emitted_at: String,
}

impl Event {
    pub fn new(subject: Subject, bot_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            subject,
            bot_id: bot_id.into(),
            payload,
            emitted_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}
