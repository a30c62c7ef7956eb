use std::sync::Arc;

use axum::{extract::State, http::StatusCode, Json};
use relaybot_core::types::{Bot, ProviderKind};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateBotRequest {
    pub id: String,
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub message_delay_ms: u64,
    #[serde(default)]
    pub ignored_labels: Vec<String>,
    #[serde(default)]
    pub exclude_groups: bool,
    #[serde(default = "default_ai_enabled")]
    pub ai_enabled: bool,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_ai_enabled() -> bool {
    true
}

/// POST /bots — provision (or update) one tenant and start its transport
/// session. Idempotent: re-posting the same id updates the row in place.
pub async fn create_bot_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateBotRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let bot = Bot {
        id: req.id.clone(),
        provider: req.provider,
        model: req.model,
        system_prompt: req.system_prompt,
        temperature: req.temperature,
        message_delay_ms: req.message_delay_ms,
        ignored_labels: req.ignored_labels,
        exclude_groups: req.exclude_groups,
        ai_enabled: req.ai_enabled,
    };

    state.repo.upsert_bot(&bot).map_err(|e| {
        warn!(bot_id = %req.id, error = %e, "failed to persist bot");
        (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
    })?;

    if let Err(e) = state.transport.start_session(&bot.id).await {
        warn!(bot_id = %bot.id, error = %e, "transport session failed to start");
    }

    info!(bot_id = %bot.id, "bot provisioned");
    Ok(Json(json!({"ok": true, "bot_id": bot.id})))
}
