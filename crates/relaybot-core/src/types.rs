use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant identifier — UUIDv7, time-sortable for log correlation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BotId(pub String);

impl BotId {
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BotId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for BotId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for BotId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Primary key for a [`Session`] — unique under `(bot_id, identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub bot_id: String,
    /// Platform-native chat/contact identifier (e.g. a WhatsApp JID).
    pub identifier: String,
}

impl SessionKey {
    pub fn new(bot_id: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            identifier: identifier.into(),
        }
    }

    pub fn format(&self) -> String {
        format!("bot:{}:session:{}", self.bot_id, self.identifier)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Tenant record (spec.md §3 "Bot").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    /// Milliseconds the Accumulator waits before flushing a burst. 0 = bypass.
    pub message_delay_ms: u64,
    /// Label names whose sessions the automation sweeper must skip.
    pub ignored_labels: Vec<String>,
    pub exclude_groups: bool,
    pub ai_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    OpenAi,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::OpenAi => write!(f, "openai"),
        }
    }
}

/// A (bot, external-identifier) pairing (spec.md §3 "Session").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub bot_id: String,
    pub identifier: String,
    pub display_name: Option<String>,
    pub platform: String,
    pub status: SessionStatus,
    pub message_count: u64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Archived,
}

/// Message type (spec.md §3 "Message").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Text,
    Image,
    Audio,
    Document,
}

/// An inbound or outbound message unit (spec.md §3 "Message").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    /// Globally unique, used for dedup. `None` for synthetic messages
    /// (automation turns) which are never deduplicated.
    pub external_id: Option<String>,
    pub sender: String,
    pub from_me: bool,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub is_processed: bool,
    pub created_at: String,
}

/// Role of a conversation turn (spec.md §3 "ConversationTurn").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Role {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

/// One entry in the AI conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Option<String>,
    /// Present only on assistant turns that invoked tools.
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRef>,
    /// Present only on tool-role turns.
    pub tool_call_id: Option<String>,
    pub tool_name: Option<String>,
    pub created_at: String,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn assistant(content: Option<String>, tool_calls: Vec<ToolCallRef>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            tool_name: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, tool_name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
            tool_name: Some(tool_name.into()),
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// A tool call requested by an assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRef {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    /// Provider A ("Gemini-style") opaque signature carried on the call.
    /// `None` for provider B and for calls that have been downgraded.
    #[serde(default)]
    pub thought_signature: Option<String>,
}

/// Lifecycle status of a [`ToolRow`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ToolStatus {
    Active,
    Disabled,
}

/// How a tool's invocation is dispatched (spec.md §3 "Tool").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ActionType {
    Flow,
    Webhook,
    Builtin,
}

/// A named, schema-typed function the AI model may invoke.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRow {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
    pub action_type: ActionType,
    pub action_config: serde_json::Value,
    pub status: ToolStatus,
    pub flow_id: Option<String>,
}

/// Tool names visible to the model must match this shape.
pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Sanitise an arbitrary label into a valid snake_case tool name.
pub fn sanitize_tool_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('_') {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepType {
    Text,
    Image,
    Audio,
    Ptt,
}

/// One step in a [`Flow`] (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub order: u32,
    pub step_type: StepType,
    /// May contain `{{placeholder}}` tokens substituted from tool arguments.
    pub content: Option<String>,
    pub media_url: Option<String>,
    pub delay_ms: u64,
}

/// Ordered sequence of outbound steps (spec.md §3 "Flow").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub steps: Vec<Step>,
}

/// A WhatsApp label mirrored bidirectionally (spec.md §3 "Label").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub bot_id: String,
    pub wa_label_id: String,
    pub name: String,
}

/// A rule that injects a synthetic turn into a stale session (spec.md §3 "Automation").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Automation {
    pub id: String,
    pub bot_id: String,
    pub name: String,
    pub enabled: bool,
    pub label_name: Option<String>,
    pub timeout_ms: u64,
    pub prompt: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMatchType {
    Contains,
    Equals,
    StartsWith,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerScope {
    Incoming,
    Outgoing,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    pub bot_id: String,
    pub flow_id: String,
    pub keyword: String,
    pub match_type: TriggerMatchType,
    pub scope: TriggerScope,
}

/// A tenant-CRM contact record (spec.md §4.4 `lookup_client`/`register_client`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub bot_id: String,
    pub curp: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub credentials: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// 18 uppercase-alphanumeric characters, the shape of a Mexican CURP.
pub fn is_valid_curp(curp: &str) -> bool {
    curp.len() == 18 && curp.chars().all(|c| c.is_ascii_alphanumeric())
}

/// 10 to 15 digits, loosely matching E.164 without requiring a leading `+`.
pub fn is_valid_phone(phone: &str) -> bool {
    let digits = phone.chars().filter(|c| c.is_ascii_digit()).count();
    digits == phone.len() && (10..=15).contains(&digits)
}

/// A minimal `local@domain.tld` shape check — not full RFC 5322.
pub fn is_valid_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else { return false };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_key_roundtrip_format() {
        let key = SessionKey::new("b1", "5215512345678@s.whatsapp.net");
        assert_eq!(key.format(), "bot:b1:session:5215512345678@s.whatsapp.net");
    }

    #[test]
    fn tool_name_validation() {
        assert!(is_valid_tool_name("get_current_time"));
        assert!(!is_valid_tool_name("Get-Time"));
        assert!(!is_valid_tool_name(""));
    }

    #[test]
    fn sanitize_strips_invalid_chars() {
        assert_eq!(sanitize_tool_name("Get Current Time!"), "get_current_time");
        assert_eq!(sanitize_tool_name("  leading"), "leading");
    }

    #[test]
    fn curp_phone_email_validation() {
        assert!(is_valid_curp("ABCD010101HDFLRN09"));
        assert!(!is_valid_curp("short"));
        assert!(is_valid_phone("5215512345678"));
        assert!(!is_valid_phone("123"));
        assert!(is_valid_email("a@b.com"));
        assert!(!is_valid_email("not-an-email"));
    }
}
