use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relaybot_agent::{AIEngine, Accumulator, NoopMediaPipeline};
use relaybot_conversation::ConversationStore;
use relaybot_core::config::RelaybotConfig;
use relaybot_events::EventBus;
use relaybot_flows::FlowEngine;
use relaybot_kv::{InMemoryKv, KvStore};
use relaybot_providers::{GeminiProvider, LlmProvider, OpenAiProvider, ProviderRouter};
use relaybot_scheduler::AutomationSweeper;
use relaybot_store::SqliteRepository;
use relaybot_tools::{ToolExecutor, ToolRegistry};
use relaybot_transport::{FakeTransport, Transport};
use tokio::sync::watch;
use tracing::{info, warn};

mod app;
mod http;

#[derive(Parser, Debug)]
#[command(name = "relaybot-gateway")]
struct Cli {
    /// Path to relaybot.toml. Falls back to RELAYBOT_CONFIG, then
    /// ~/.relaybot/relaybot.toml.
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relaybot_gateway=info,tower_http=debug".into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("RELAYBOT_CONFIG").ok());
    let config = RelaybotConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("config load failed ({}), using defaults", e);
        RelaybotConfig::default()
    });

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let repo = Arc::new(SqliteRepository::open(&config.database.path)?);
    let conversations = Arc::new(ConversationStore::new(
        rusqlite::Connection::open(&config.database.path)?,
        config.runtime.conv_max_messages,
        config.runtime.conv_ttl_secs,
        config.runtime.conv_pg_history_days,
    )?);
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::default());
    let transport: Arc<dyn Transport> = Arc::new(FakeTransport::new());
    let events = Arc::new(EventBus::new());
    let media = Arc::new(NoopMediaPipeline);

    let tools = Arc::new(ToolRegistry::new(repo.clone()));
    let executor = Arc::new(ToolExecutor::new(repo.clone(), conversations.clone(), transport.clone()));
    let flows = Arc::new(FlowEngine::new(repo.clone(), transport.clone()));

    let mut providers_map: HashMap<_, Arc<dyn LlmProvider>> = HashMap::new();
    if let Some(gemini) = &config.providers.gemini {
        providers_map.insert(
            relaybot_core::types::ProviderKind::Gemini,
            Arc::new(GeminiProvider::new(gemini.api_key.clone(), Some(gemini.base_url.clone()))) as Arc<dyn LlmProvider>,
        );
    }
    if let Some(openai) = &config.providers.openai {
        providers_map.insert(
            relaybot_core::types::ProviderKind::OpenAi,
            Arc::new(OpenAiProvider::new(openai.api_key.clone(), Some(openai.base_url.clone()))) as Arc<dyn LlmProvider>,
        );
    }
    let providers = Arc::new(ProviderRouter::new(providers_map, config.providers.failover.clone()));

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
        config.providers.failover.clone(),
        Duration::from_secs(config.runtime.lock_ttl_secs),
        config.runtime.max_tool_iterations,
        config.runtime.max_pending_retries,
    ));
    let accumulator = Arc::new(Accumulator::new(agent.clone()));

    for bot in repo.list_bots().unwrap_or_default() {
        if let Err(e) = transport.start_session(&bot.id).await {
            warn!(bot_id = %bot.id, error = %e, "failed to start transport session at boot");
        }
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = AutomationSweeper::new(
        repo.clone(),
        kv.clone(),
        agent.clone(),
        Duration::from_millis(config.runtime.automation_check_interval_ms),
    );
    let sweeper_handle = tokio::spawn(sweeper.run(shutdown_rx));

    let bind = config.gateway.bind.clone();
    let port = config.gateway.port;
    let state = Arc::new(app::AppState::new(config, repo, kv, agent, accumulator.clone(), transport.clone(), events));
    let router = app::build_router(state);

    let addr: std::net::SocketAddr = format!("{bind}:{port}").parse()?;
    info!("relaybot gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    accumulator.flush_all().await;
    transport.shutdown_all().await.ok();
    sweeper_handle.await.ok();

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
