use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use relaybot_core::types::MessageType;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct IngestMessageRequest {
    /// Stable per-conversation identifier, e.g. the WhatsApp JID.
    pub identifier: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Globally unique id from the transport, used for dedup. Absent only
    /// for synthetic traffic (the gateway never accepts that over HTTP).
    pub external_id: String,
    pub sender: String,
    #[serde(default)]
    pub from_me: bool,
    pub content: String,
    #[serde(default = "default_message_type")]
    pub message_type: MessageType,
    #[serde(default)]
    pub media_url: Option<String>,
}

fn default_platform() -> String {
    "whatsapp".into()
}

fn default_message_type() -> MessageType {
    MessageType::Text
}

/// POST /bots/:bot_id/messages — the transport's inbound ingress
/// (spec.md §4 control flow: "Transport -> (optional Accumulator) ->
/// AIEngine.process"). Upserts the session/message, then hands the message
/// to the accumulator, which itself bypasses debouncing when the bot's
/// `message_delay_ms` is 0 (spec.md §8 "Boundary behaviour").
pub async fn ingest_message_handler(
    State(state): State<Arc<AppState>>,
    Path(bot_id): Path<String>,
    Json(req): Json<IngestMessageRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(bot) = state.repo.get_bot(&bot_id).map_err(internal_error)? else {
        warn!(bot_id = %bot_id, "message for unknown bot rejected");
        return Err((StatusCode::NOT_FOUND, Json(json!({"error": "unknown bot"}))));
    };

    let session = state
        .repo
        .get_or_create_session(&bot_id, &req.identifier, req.display_name.as_deref(), &req.platform)
        .map_err(internal_error)?;

    let (message, created) = state
        .repo
        .upsert_inbound_message(
            &session.id,
            Some(&req.external_id),
            &req.sender,
            req.from_me,
            &req.content,
            req.message_type,
            req.media_url.as_deref(),
        )
        .map_err(internal_error)?;

    if !created {
        info!(bot_id = %bot_id, external_id = %req.external_id, "duplicate external_id, skipping dispatch");
        return Ok(Json(json!({"ok": true, "session_id": session.id, "duplicate": true})));
    }

    state.repo.bump_session_stats(&session.id).map_err(internal_error)?;

    // spec.md §8 "Boundary behaviour": delay_ms = 0 bypasses the debounce
    // buffer entirely rather than accumulating a single-message batch.
    if bot.message_delay_ms == 0 {
        let agent = state.agent.clone();
        let session_id = session.id.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.process_message(&session_id, message).await {
                warn!(session_id = %session_id, error = %e, "inline AI turn failed");
            }
        });
    } else {
        state.accumulator.accumulate(&session.id, message, bot.message_delay_ms);
    }

    Ok(Json(json!({"ok": true, "session_id": session.id, "duplicate": false})))
}

fn internal_error(e: relaybot_store::StoreError) -> (StatusCode, Json<Value>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaybot_agent::{AIEngine, Accumulator, NoopMediaPipeline};
    use relaybot_conversation::ConversationStore;
    use relaybot_core::config::RelaybotConfig;
    use relaybot_core::types::{Bot, ProviderKind};
    use relaybot_events::EventBus;
    use relaybot_flows::FlowEngine;
    use relaybot_kv::InMemoryKv;
    use relaybot_providers::{ChatRequest, ChatResponse, LlmProvider, ProviderRouter, Usage};
    use relaybot_store::SqliteRepository;
    use relaybot_tools::{ToolExecutor, ToolRegistry};
    use relaybot_transport::FakeTransport;
    use rusqlite::Connection;
    use std::collections::HashMap;
    use std::time::Duration;
    use tower::ServiceExt;

    struct EchoProvider;
    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn chat(&self, _req: &ChatRequest) -> relaybot_providers::Result<ChatResponse> {
            Ok(ChatResponse { content: Some("ack".into()), tool_calls: Vec::new(), usage: Some(Usage::default()), used_fallback: false })
        }
    }

    fn test_state() -> Arc<AppState> {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        repo.upsert_bot(&Bot {
            id: "bot1".into(),
            provider: ProviderKind::Gemini,
            model: "gemini-2.5-flash".into(),
            system_prompt: Some("assistant".into()),
            temperature: 0.7,
            message_delay_ms: 0,
            ignored_labels: Vec::new(),
            exclude_groups: false,
            ai_enabled: true,
        })
        .unwrap();

        let kv: Arc<dyn relaybot_kv::KvStore> = Arc::new(InMemoryKv::default());
        let transport: Arc<dyn relaybot_transport::Transport> = Arc::new(FakeTransport::new());
        let conversations = Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap(), 100, 3600, 30).unwrap());
        let tools = Arc::new(ToolRegistry::new(repo.clone()));
        let executor = Arc::new(ToolExecutor::new(repo.clone(), conversations.clone(), transport.clone()));
        let flows = Arc::new(FlowEngine::new(repo.clone(), transport.clone()));
        let mut providers_map: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        providers_map.insert(ProviderKind::Gemini, Arc::new(EchoProvider));
        let providers = Arc::new(ProviderRouter::new(providers_map, HashMap::new()));
        let events = Arc::new(EventBus::new());
        let media = Arc::new(NoopMediaPipeline);

        let agent = Arc::new(AIEngine::new(
            repo.clone(),
            kv.clone(),
            conversations,
            tools,
            executor,
            flows,
            providers,
            transport.clone(),
            events.clone(),
            media,
            HashMap::new(),
            Duration::from_secs(60),
            10,
            3,
        ));
        let accumulator = Arc::new(Accumulator::new(agent.clone()));

        Arc::new(AppState::new(RelaybotConfig::default(), repo, kv, agent, accumulator, transport, events))
    }

    #[tokio::test]
    async fn ingest_creates_session_and_dispatches_once() {
        let state = test_state();

        let result = ingest_message_handler(
            State(state.clone()),
            Path("bot1".into()),
            Json(IngestMessageRequest {
                identifier: "5551234".into(),
                display_name: None,
                platform: "whatsapp".into(),
                external_id: "wamid-1".into(),
                sender: "5551234".into(),
                from_me: false,
                content: "hola".into(),
                message_type: MessageType::Text,
                media_url: None,
            }),
        )
        .await
        .unwrap();

        assert_eq!(result.0["duplicate"], false);
        assert!(result.0["session_id"].as_str().is_some());

        // Give the spawned inline turn (delay_ms = 0) a chance to run.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.repo.get_session("bot1", "5551234").unwrap().unwrap().message_count, 2);
    }

    #[tokio::test]
    async fn duplicate_external_id_is_not_redispatched() {
        let state = test_state();
        let req = || IngestMessageRequest {
            identifier: "5551234".into(),
            display_name: None,
            platform: "whatsapp".into(),
            external_id: "wamid-dup".into(),
            sender: "5551234".into(),
            from_me: false,
            content: "hola".into(),
            message_type: MessageType::Text,
            media_url: None,
        };

        ingest_message_handler(State(state.clone()), Path("bot1".into()), Json(req())).await.unwrap();
        let second = ingest_message_handler(State(state.clone()), Path("bot1".into()), Json(req())).await.unwrap();

        assert_eq!(second.0["duplicate"], true);
    }

    #[tokio::test]
    async fn unknown_bot_is_rejected() {
        let state = test_state();
        let err = ingest_message_handler(
            State(state),
            Path("ghost".into()),
            Json(IngestMessageRequest {
                identifier: "555".into(),
                display_name: None,
                platform: "whatsapp".into(),
                external_id: "w1".into(),
                sender: "555".into(),
                from_me: false,
                content: "hi".into(),
                message_type: MessageType::Text,
                media_url: None,
            }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn health_router_serves_status_ok() {
        let state = test_state();
        let router = crate::app::build_router(state);
        let response = router
            .oneshot(axum::http::Request::builder().uri("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
