use serde::{Deserialize, Serialize};

/// Returned by `reply_to_message` when a `message_id` was already answered
/// within the same turn (spec.md §4.4 / S3). The AI loop matches on this
/// literal to decide whether every call in a tool-loop iteration was a
/// duplicate, in which case it breaks the loop instead of re-calling the
/// provider.
pub const REPLY_ALREADY_HANDLED_MESSAGE: &str = "Ya respondiste a este mensaje. No es necesario responder de nuevo.";

/// What `ToolRegistry::tools_for_bot` hands to the provider (spec.md §4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters_schema: serde_json::Value,
}

/// What `ToolExecutor::execute` returns (spec.md §4.4) — never an `Err`,
/// failures are folded into `success: false` so the model can see and react.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub success: bool,
    pub data: String,
}

impl ToolCallResult {
    pub fn ok(data: impl Into<String>) -> Self {
        Self { success: true, data: data.into() }
    }

    pub fn fail(data: impl Into<String>) -> Self {
        Self { success: false, data: data.into() }
    }
}
