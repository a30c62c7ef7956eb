use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::app::AppState;

/// GET /health — liveness probe, one connection-status row per bot.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let bots: Vec<Value> = state
        .repo
        .list_bots()
        .map(|bots| {
            bots.into_iter()
                .map(|bot| {
                    json!({
                        "bot_id": bot.id,
                        "provider": bot.provider.to_string(),
                        "ai_enabled": bot.ai_enabled,
                        "transport_status": state.transport.status(&bot.id),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Json(json!({
        "status": "ok",
        "bots": bots,
    }))
}
