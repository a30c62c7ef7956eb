use serde_json::json;

use crate::types::ToolDefinition;

/// The fixed enumeration of built-in tools (spec.md §4.3). Every name here
/// shadows any DB tool attempt to register the same name.
pub const BUILTIN_NAMES: &[&str] = &[
    "get_current_time",
    "clear_conversation",
    "get_labels",
    "assign_label",
    "remove_label",
    "get_sessions_by_label",
    "reply_to_message",
    "send_followup_message",
    "lookup_client",
    "register_client",
    "save_credentials",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

/// Definitions for every built-in, independent of any bot (used to fill the
/// gaps left by `1. DB tools for this bot`).
pub fn builtin_definitions() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "get_current_time".into(),
            description: "Get the current localised time for the bot's timezone.".into(),
            parameters_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "clear_conversation".into(),
            description: "Clear the conversation history for this session.".into(),
            parameters_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "get_labels".into(),
            description: "List this bot's labels with how many sessions hold each.".into(),
            parameters_schema: json!({"type": "object", "properties": {}}),
        },
        ToolDefinition {
            name: "assign_label".into(),
            description: "Assign a label to the current session by name.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"label": {"type": "string"}},
                "required": ["label"],
            }),
        },
        ToolDefinition {
            name: "remove_label".into(),
            description: "Remove a label from the current session by name.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"label": {"type": "string"}},
                "required": ["label"],
            }),
        },
        ToolDefinition {
            name: "get_sessions_by_label".into(),
            description: "List sessions holding a named label, each with its last few messages.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"label": {"type": "string"}, "limit": {"type": "integer"}},
                "required": ["label"],
            }),
        },
        ToolDefinition {
            name: "reply_to_message".into(),
            description: "Quote-reply to a specific earlier message by its external id.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"message_id": {"type": "string"}, "text": {"type": "string"}},
                "required": ["message_id", "text"],
            }),
        },
        ToolDefinition {
            name: "send_followup_message".into(),
            description: "Send a text message to a different session of the same bot.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"identifier": {"type": "string"}, "text": {"type": "string"}},
                "required": ["identifier", "text"],
            }),
        },
        ToolDefinition {
            name: "lookup_client".into(),
            description: "Look up a CRM client record by CURP.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"curp": {"type": "string"}},
                "required": ["curp"],
            }),
        },
        ToolDefinition {
            name: "register_client".into(),
            description: "Register a new CRM client record.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {
                    "curp": {"type": "string"},
                    "phone": {"type": "string"},
                    "email": {"type": "string"},
                },
                "required": ["curp"],
            }),
        },
        ToolDefinition {
            name: "save_credentials".into(),
            description: "Save arbitrary credential fields against an existing CRM client.".into(),
            parameters_schema: json!({
                "type": "object",
                "properties": {"curp": {"type": "string"}, "credentials": {"type": "object"}},
                "required": ["curp", "credentials"],
            }),
        },
    ]
}
