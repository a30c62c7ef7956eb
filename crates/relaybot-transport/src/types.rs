use serde::{Deserialize, Serialize};

/// Context used to render a quote-reply (spec.md §6 `contextInfo`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotedContext {
    pub stanza_id: String,
    pub participant: String,
    pub quoted_conversation: String,
}

/// What `Transport::send_message` delivers (spec.md §6 payload variants).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundPayload {
    Text { text: String },
    Image { url: String, caption: Option<String> },
    Audio { url: String, ptt: bool },
    Quoted { text: String, context: QuotedContext },
}

impl OutboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Presence {
    Composing,
    Paused,
}

/// Runtime connection state of a bot's transport session (spec.md §6).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error(String),
}

/// A synced WhatsApp label, as returned by `sync_labels`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLabel {
    pub wa_label_id: String,
    pub name: String,
}
