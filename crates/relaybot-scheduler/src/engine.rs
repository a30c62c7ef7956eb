//! Label-driven inactivity sweep (spec.md §4.8 `AutomationSweeper`).
//!
//! Runs on a fixed cadence, same `tokio::time::interval` + `watch` shutdown
//! shape as the teacher's job-scheduler tick loop, but with nothing
//! persisted locally — every decision is made fresh off the repository and
//! the idempotency lease in the KV store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use relaybot_agent::AIEngine;
use relaybot_core::types::{Automation, Message, MessageType};
use relaybot_kv::KvStore;
use relaybot_store::SqliteRepository;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::Result;

fn lease_key(automation_id: &str, session_id: &str) -> String {
    format!("automation:done:{automation_id}:{session_id}")
}

/// Periodic scan for stale sessions that should receive a synthetic nudge
/// (spec.md §4.8). Owns no state of its own — restart-safe by construction.
pub struct AutomationSweeper {
    repo: Arc<SqliteRepository>,
    kv: Arc<dyn KvStore>,
    agent: Arc<AIEngine>,
    check_interval: Duration,
}

impl AutomationSweeper {
    pub fn new(repo: Arc<SqliteRepository>, kv: Arc<dyn KvStore>, agent: Arc<AIEngine>, check_interval: Duration) -> Self {
        Self { repo, kv, agent, check_interval }
    }

    /// Main loop. Ticks every `check_interval` until `shutdown` broadcasts `true`.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.check_interval.as_millis() as u64, "automation sweeper started");
        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "automation sweep tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("automation sweeper shutting down");
                        break;
                    }
                }
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<()> {
        let automations = self.repo.list_runnable_automations()?;
        for automation in automations {
            if let Err(e) = self.sweep_automation(&automation).await {
                warn!(automation_id = %automation.id, error = %e, "automation sweep failed");
            }
        }
        Ok(())
    }

    async fn sweep_automation(&self, automation: &Automation) -> Result<()> {
        let Some(bot) = self.repo.get_bot(&automation.bot_id)? else {
            return Ok(());
        };

        let sessions = match &automation.label_name {
            Some(label_name) => self.repo.sessions_by_label(&automation.bot_id, label_name, &bot.ignored_labels)?,
            None => self.repo.sessions_without_labels(&automation.bot_id)?,
        };

        let now = Utc::now();
        let staleness = chrono::Duration::milliseconds(automation.timeout_ms as i64);

        for session in sessions {
            let Some(last_inbound) = self.repo.last_inbound_message(&session.id)? else {
                continue;
            };
            let Ok(last_at) = DateTime::parse_from_rfc3339(&last_inbound.created_at) else {
                continue;
            };
            if last_at.with_timezone(&Utc) > now - staleness {
                continue;
            }

            let lease = lease_key(&automation.id, &session.id);
            if !self.kv.set_if_absent(&lease, "1", Duration::from_millis(automation.timeout_ms)).await? {
                debug!(automation_id = %automation.id, session_id = %session.id, "idempotency lease already held, skipping");
                continue;
            }

            let message = Message {
                id: Uuid::now_v7().to_string(),
                session_id: session.id.clone(),
                external_id: None,
                sender: "system".into(),
                from_me: false,
                content: format!("[Automation: {}] {}", automation.name, automation.prompt),
                message_type: MessageType::Text,
                media_url: None,
                is_processed: false,
                created_at: now.to_rfc3339(),
            };

            info!(automation_id = %automation.id, session_id = %session.id, "dispatching synthetic automation turn");
            self.agent.process_message(&session.id, message).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use relaybot_agent::{AIEngine, MediaPipeline, NoopMediaPipeline};
    use relaybot_conversation::ConversationStore;
    use relaybot_core::types::{Bot, ProviderKind};
    use relaybot_events::EventBus;
    use relaybot_flows::FlowEngine;
    use relaybot_kv::InMemoryKv;
    use relaybot_providers::{ChatRequest, ChatResponse, LlmProvider, ProviderRouter, Usage};
    use relaybot_tools::{ToolExecutor, ToolRegistry};
    use relaybot_transport::{FakeTransport, OutboundPayload, Transport};
    use rusqlite::Connection;
    use std::collections::HashMap;

    struct StaticProvider;
    #[async_trait]
    impl LlmProvider for StaticProvider {
        fn name(&self) -> &str {
            "static"
        }
        async fn chat(&self, _req: &ChatRequest) -> relaybot_providers::Result<ChatResponse> {
            Ok(ChatResponse { content: Some("¿sigues ahí?".into()), tool_calls: Vec::new(), usage: Some(Usage::default()), used_fallback: false })
        }
    }

    fn build_agent(repo: Arc<SqliteRepository>, transport: Arc<FakeTransport>, kv: Arc<dyn KvStore>) -> Arc<AIEngine> {
        let conversations = Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap(), 100, 3600, 30).unwrap());
        let tools = Arc::new(ToolRegistry::new(repo.clone()));
        let executor = Arc::new(ToolExecutor::new(repo.clone(), conversations.clone(), transport.clone() as Arc<dyn Transport>));
        let flows = Arc::new(FlowEngine::new(repo.clone(), transport.clone() as Arc<dyn Transport>));
        let mut providers_map: HashMap<ProviderKind, Arc<dyn LlmProvider>> = HashMap::new();
        providers_map.insert(ProviderKind::Gemini, Arc::new(StaticProvider));
        let providers = Arc::new(ProviderRouter::new(providers_map, HashMap::new()));
        let events = Arc::new(EventBus::new());
        let media: Arc<dyn MediaPipeline> = Arc::new(NoopMediaPipeline);
        Arc::new(AIEngine::new(
            repo,
            kv,
            conversations,
            tools,
            executor,
            flows,
            providers,
            transport as Arc<dyn Transport>,
            events,
            media,
            HashMap::new(),
            Duration::from_secs(60),
            10,
            3,
        ))
    }

    #[tokio::test]
    async fn stale_labelled_session_gets_one_synthetic_turn_per_window() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let bot = Bot {
            id: "bot1".into(),
            provider: ProviderKind::Gemini,
            model: "gemini-2.5-flash".into(),
            system_prompt: Some("assistant".into()),
            temperature: 0.7,
            message_delay_ms: 0,
            ignored_labels: Vec::new(),
            exclude_groups: false,
            ai_enabled: true,
        };
        repo.upsert_bot(&bot).unwrap();
        let session = repo.get_or_create_session("bot1", "5551234", None, "whatsapp").unwrap();
        let label = repo.upsert_label("bot1", "wa-label-1", "FOLLOWUP").unwrap();
        repo.assign_session_label(&session.id, &label.id).unwrap();

        repo.upsert_inbound_message(&session.id, Some("ext-1"), "5551234", false, "hola", MessageType::Text, None)
            .unwrap();

        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::default());
        let transport = Arc::new(FakeTransport::new());
        let agent = build_agent(repo.clone(), transport.clone(), kv.clone());

        // Short timeout so the just-inserted message counts as stale once we
        // sleep past it, without needing to backdate rows directly.
        repo.create_automation("bot1", "follow up", true, Some("FOLLOWUP"), 150, "¿Sigues ahí?").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let sweeper = AutomationSweeper::new(repo.clone(), kv.clone(), agent, Duration::from_secs(1));
        sweeper.tick().await.unwrap();
        sweeper.tick().await.unwrap();

        let sent = transport.sent_to("bot1", "5551234");
        assert_eq!(sent.len(), 1, "idempotency lease must suppress the second sweep");
        match &sent[0] {
            OutboundPayload::Text { text } => assert_eq!(text, "¿sigues ahí?"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
