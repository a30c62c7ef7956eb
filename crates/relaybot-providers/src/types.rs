use relaybot_core::types::{ConversationTurn, ToolCallRef};
use serde::{Deserialize, Serialize};

/// A tool definition offered to the model — decoupled from `relaybot-tools`'
/// own `ToolDefinition` so this crate has no dependency on tool dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    Off,
    Low,
    Medium,
    High,
}

/// spec.md §4.5 `chat({model, messages, tools?, temperature?, thinkingLevel?})`.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ConversationTurn>,
    pub tools: Vec<ToolSpec>,
    pub temperature: f32,
    pub thinking_level: Option<ThinkingLevel>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub tokens_in: u32,
    pub tokens_out: u32,
}

/// spec.md §4.5 `{content?, toolCalls[], usage?}`.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCallRef>,
    pub usage: Option<Usage>,
    /// Set by the failover router when this response came from the
    /// fallback provider, so the caller can pin it for the rest of the turn
    /// (spec.md §4.6.1).
    pub used_fallback: bool,
}
