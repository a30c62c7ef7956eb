use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use relaybot_agent::{AIEngine, Accumulator};
use relaybot_core::config::RelaybotConfig;
use relaybot_events::EventBus;
use relaybot_kv::KvStore;
use relaybot_store::SqliteRepository;
use relaybot_transport::Transport;

/// Shared state handed to every Axum handler (spec.md §4.6 control flow,
/// assembled once at startup).
pub struct AppState {
    pub config: RelaybotConfig,
    pub repo: Arc<SqliteRepository>,
    pub kv: Arc<dyn KvStore>,
    pub agent: Arc<AIEngine>,
    pub accumulator: Arc<Accumulator<AIEngine>>,
    pub transport: Arc<dyn Transport>,
    pub events: Arc<EventBus>,
}

impl AppState {
    pub fn new(
        config: RelaybotConfig,
        repo: Arc<SqliteRepository>,
        kv: Arc<dyn KvStore>,
        agent: Arc<AIEngine>,
        accumulator: Arc<Accumulator<AIEngine>>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
    ) -> Self {
        Self { config, repo, kv, agent, accumulator, transport, events }
    }
}

/// Assemble the full Axum router. Deliberately small — the transport is the
/// system's real ingress; HTTP here exists for health checks, bot
/// provisioning, and driving inbound traffic in deployments that front the
/// transport with an HTTP bridge process.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route("/bots", post(crate::http::bots::create_bot_handler))
        .route(
            "/bots/{bot_id}/messages",
            post(crate::http::messages::ingest_message_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
