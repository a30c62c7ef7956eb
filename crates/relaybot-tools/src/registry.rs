use std::sync::Arc;

use relaybot_core::types::ActionType;
use relaybot_store::SqliteRepository;

use crate::builtin::{builtin_definitions, is_builtin};
use crate::error::{Result, ToolsError};
use crate::types::ToolDefinition;

/// Enumerates built-in + bot-defined tools and sanitises names on create
/// (spec.md §4.3).
pub struct ToolRegistry {
    repo: Arc<SqliteRepository>,
}

impl ToolRegistry {
    pub fn new(repo: Arc<SqliteRepository>) -> Self {
        Self { repo }
    }

    /// DB tools for `bot_id`, then any built-in whose name isn't already
    /// taken. DB rows always win a name collision.
    pub fn tools_for_bot(&self, bot_id: &str) -> Result<Vec<ToolDefinition>> {
        let db_tools = self.repo.list_active_tools(bot_id)?;
        let mut taken: std::collections::HashSet<String> =
            db_tools.iter().map(|t| t.name.clone()).collect();

        let mut out: Vec<ToolDefinition> = db_tools
            .into_iter()
            .map(|t| ToolDefinition {
                name: t.name,
                description: t.description,
                parameters_schema: t.parameters_schema,
            })
            .collect();

        for def in builtin_definitions() {
            if taken.insert(def.name.clone()) {
                out.push(def);
            }
        }
        Ok(out)
    }

    /// Create a bot-defined tool. Fails with `ReservedName` if it collides
    /// with a built-in (spec.md §4.3 "built-in name on create fails with
    /// ALREADY_EXISTS semantics").
    #[allow(clippy::too_many_arguments)]
    pub fn create_tool(
        &self,
        bot_id: &str,
        name: &str,
        description: &str,
        parameters_schema: &serde_json::Value,
        action_type: ActionType,
        action_config: &serde_json::Value,
        flow_id: Option<&str>,
    ) -> Result<relaybot_core::types::ToolRow> {
        let sanitized = relaybot_core::types::sanitize_tool_name(name);
        if is_builtin(&sanitized) {
            return Err(ToolsError::ReservedName(sanitized));
        }
        Ok(self.repo.create_tool(
            bot_id,
            &sanitized,
            description,
            parameters_schema,
            action_type,
            action_config,
            flow_id,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::new(Arc::new(SqliteRepository::open_in_memory().unwrap()))
    }

    #[test]
    fn builtins_fill_in_around_db_tools() {
        let reg = registry();
        let defs = reg.tools_for_bot("b1").unwrap();
        assert!(defs.iter().any(|d| d.name == "get_current_time"));
    }

    #[test]
    fn db_tool_shadows_builtin_by_winning_the_name() {
        let reg = registry();
        reg.repo
            .create_tool(
                "b1",
                "get_current_time",
                "custom override",
                &serde_json::json!({}),
                ActionType::Webhook,
                &serde_json::json!({"url": "https://example.com"}),
                None,
            )
            .unwrap();
        let defs = reg.tools_for_bot("b1").unwrap();
        let matches: Vec<_> = defs.iter().filter(|d| d.name == "get_current_time").collect();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].description, "custom override");
    }

    #[test]
    fn create_tool_rejects_builtin_collision() {
        let reg = registry();
        let err = reg
            .create_tool(
                "b1",
                "Get Labels",
                "x",
                &serde_json::json!({}),
                ActionType::Builtin,
                &serde_json::json!({}),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, ToolsError::ReservedName(_)));
    }
}
