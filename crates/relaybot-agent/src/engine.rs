//! Inbound message orchestration (spec.md §4.6 `AIEngine.processMessages`).
//!
//! One call walks the whole documented pipeline: acquire the session lock,
//! preprocess media, append the user turn, run the provider tool loop, send
//! the reply, release the lock, then drain anything that queued up while the
//! lock was held.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaybot_conversation::ConversationStore;
use relaybot_core::config::FailoverTarget;
use relaybot_core::types::{Bot, ConversationTurn, Message, MessageType, ProviderKind, Role, Session};
use relaybot_events::{EventBus, Subject};
use relaybot_flows::FlowEngine;
use relaybot_kv::KvStore;
use relaybot_providers::{ChatRequest, ProviderRouter, ToolSpec};
use relaybot_store::SqliteRepository;
use relaybot_tools::{ToolContext, ToolExecutor, ToolRegistry, REPLY_ALREADY_HANDLED_MESSAGE};
use relaybot_transport::{OutboundPayload, Presence, Transport};
use serde_json::json;
use tracing::{instrument, warn};

use crate::accumulator::MessageSink;
use crate::error::Result;
use crate::media::{is_remote, truncate_pdf_text, MediaPipeline};

const APOLOGY_MESSAGE: &str = "Lo siento, ocurrió un error al procesar tu mensaje. Por favor intenta de nuevo.";

fn lock_key(session_id: &str) -> String {
    format!("ai:lock:{session_id}")
}

fn pending_key(session_id: &str) -> String {
    format!("ai:pending:{session_id}")
}

#[allow(clippy::too_many_arguments)]
pub struct AIEngine {
    repo: Arc<SqliteRepository>,
    kv: Arc<dyn KvStore>,
    conversations: Arc<ConversationStore>,
    tools: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    flows: Arc<FlowEngine>,
    providers: Arc<ProviderRouter>,
    transport: Arc<dyn Transport>,
    events: Arc<EventBus>,
    media: Arc<dyn MediaPipeline>,
    failover: HashMap<ProviderKind, FailoverTarget>,
    lock_ttl: Duration,
    max_tool_iterations: usize,
    max_pending_retries: usize,
}

impl AIEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<SqliteRepository>,
        kv: Arc<dyn KvStore>,
        conversations: Arc<ConversationStore>,
        tools: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        flows: Arc<FlowEngine>,
        providers: Arc<ProviderRouter>,
        transport: Arc<dyn Transport>,
        events: Arc<EventBus>,
        media: Arc<dyn MediaPipeline>,
        failover: HashMap<ProviderKind, FailoverTarget>,
        lock_ttl: Duration,
        max_tool_iterations: usize,
        max_pending_retries: usize,
    ) -> Self {
        Self {
            repo,
            kv,
            conversations,
            tools,
            executor,
            flows,
            providers,
            transport,
            events,
            media,
            failover,
            lock_ttl,
            max_tool_iterations,
            max_pending_retries,
        }
    }

    pub async fn process_message(&self, session_id: &str, message: Message) -> Result<()> {
        self.process_messages(session_id, vec![message]).await
    }

    #[instrument(skip(self, messages), fields(session_id, count = messages.len()))]
    pub async fn process_messages(&self, session_id: &str, messages: Vec<Message>) -> Result<()> {
        self.process_messages_depth(session_id, messages, 0).await
    }

    async fn process_messages_depth(&self, session_id: &str, messages: Vec<Message>, depth: usize) -> Result<()> {
        if messages.is_empty() {
            return Ok(());
        }

        let Some(session) = self.repo.get_session_by_id(session_id)? else {
            warn!(session_id, "session vanished before processing, dropping batch");
            return Ok(());
        };
        let Some(bot) = self.repo.get_bot(&session.bot_id)? else {
            warn!(session_id, bot_id = %session.bot_id, "bot vanished before processing, dropping batch");
            return Ok(());
        };

        if !bot.ai_enabled {
            for message in &messages {
                let _ = self.flows.evaluate_and_run(
                    &bot.id,
                    session_id,
                    &session.identifier,
                    &message.content,
                    message.from_me,
                )?;
            }
            return Ok(());
        }

        let lock_value = format!("{}:{}", bot.id, session_id);
        if !self.kv.set_if_absent(&lock_key(session_id), &lock_value, self.lock_ttl).await? {
            let ttl = self.lock_ttl + Duration::from_secs(30);
            let ids: Vec<&str> = messages.iter().map(|m| m.id.as_str()).collect();
            let batch = serde_json::to_string(&ids).map_err(|e| relaybot_store::StoreError::Invalid(e.to_string()))?;
            self.kv.rpush(&pending_key(session_id), &batch, ttl).await?;
            return Ok(());
        }

        let turn_result = self.run_turn(&session, &bot, &messages).await;
        if let Err(e) = self.kv.del(&lock_key(session_id)).await {
            warn!(session_id, error = %e, "failed to release AI lock");
        }

        if let Err(e) = &turn_result {
            warn!(session_id, error = %e, "AI turn failed, sending apology");
            let _ = self
                .transport
                .send_message(&bot.id, &session.identifier, OutboundPayload::text(APOLOGY_MESSAGE))
                .await;
        }
        turn_result?;

        if depth < self.max_pending_retries {
            if let Some(batch) = self.kv.lpop(&pending_key(session_id)).await? {
                let ids: Vec<String> = serde_json::from_str(&batch).unwrap_or_default();
                if !ids.is_empty() {
                    let pending_messages = self.repo.get_messages_by_ids(&ids)?;
                    if !pending_messages.is_empty() {
                        Box::pin(self.process_messages_depth(session_id, pending_messages, depth + 1)).await?;
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_turn(&self, session: &Session, bot: &Bot, messages: &[Message]) -> Result<()> {
        let _ = self.transport.send_presence(&bot.id, &session.identifier, Presence::Composing).await;
        for message in messages {
            if let Some(external_id) = &message.external_id {
                let _ = self.transport.mark_read(&bot.id, &session.identifier, external_id).await;
            }
        }

        let mut parts = Vec::with_capacity(messages.len());
        for message in messages {
            let rendered = self.preprocess_media(message).await;
            let prefixed = match &message.external_id {
                Some(id) => format!("[msg:{id}] {rendered}"),
                None => rendered,
            };
            parts.push(prefixed);
        }
        let user_turn = ConversationTurn::user(parts.join("\n"));
        self.conversations.append(&session.id, user_turn)?;

        let ctx = ToolContext::new(&bot.id, &session.id, &session.identifier);
        let tool_defs = self.tools.tools_for_bot(&bot.id)?;
        let tool_specs: Vec<ToolSpec> = tool_defs
            .into_iter()
            .map(|t| ToolSpec { name: t.name, description: t.description, parameters_schema: t.parameters_schema })
            .collect();

        let mut current_provider = bot.provider;
        let mut current_model = bot.model.clone();
        let mut pinned_fallback = false;

        let mut final_content: Option<String> = None;
        let mut assistant_turn_stamps: Vec<String> = Vec::new();
        let mut total_tokens: u32 = 0;

        for _ in 0..self.max_tool_iterations {
            let history = self.conversations.history(&session.id)?;
            let mut req_messages = Vec::with_capacity(history.len() + 1);
            if let Some(system_prompt) = &bot.system_prompt {
                req_messages.push(ConversationTurn {
                    role: Role::System,
                    content: Some(system_prompt.clone()),
                    tool_calls: Vec::new(),
                    tool_call_id: None,
                    tool_name: None,
                    created_at: history.first().map(|t| t.created_at.clone()).unwrap_or_default(),
                });
            }
            req_messages.extend(history);

            let request = ChatRequest {
                model: current_model.clone(),
                messages: req_messages,
                tools: tool_specs.clone(),
                temperature: bot.temperature,
                thinking_level: None,
            };

            let response = if pinned_fallback {
                self.providers.chat_direct(current_provider, &request).await?
            } else {
                self.providers.chat(current_provider, &request).await?
            };

            if response.used_fallback && !pinned_fallback {
                if let Some(target) = self.failover.get(&bot.provider) {
                    current_provider = target.provider;
                    current_model = target.model.clone();
                    pinned_fallback = true;
                }
            }

            if let Some(usage) = &response.usage {
                total_tokens += usage.tokens_in + usage.tokens_out;
            }

            if response.tool_calls.is_empty() {
                final_content = response.content;
                let turn = ConversationTurn::assistant(final_content.clone(), Vec::new());
                assistant_turn_stamps.push(turn.created_at.clone());
                self.conversations.append(&session.id, turn)?;
                break;
            }

            let turn = ConversationTurn::assistant(response.content.clone(), response.tool_calls.clone());
            assistant_turn_stamps.push(turn.created_at.clone());
            self.conversations.append(&session.id, turn)?;

            let mut all_deduped = true;
            let mut tool_turns = Vec::with_capacity(response.tool_calls.len());
            for call in &response.tool_calls {
                let result = self.executor.execute(&ctx, &call.name, &call.arguments).await;
                if result.data != REPLY_ALREADY_HANDLED_MESSAGE {
                    all_deduped = false;
                }
                tool_turns.push(ConversationTurn::tool(call.id.clone(), call.name.clone(), result.data));
            }
            self.conversations.append_many(&session.id, tool_turns)?;

            if all_deduped {
                final_content = None;
                break;
            }
        }

        let _ = self.transport.send_presence(&bot.id, &session.identifier, Presence::Paused).await;

        if let Some(content) = final_content {
            if !content.is_empty() && !ctx.did_send_reply() {
                match self.transport.send_message(&bot.id, &session.identifier, OutboundPayload::text(content.clone())).await {
                    Ok(()) => {
                        self.events.emit_json(Subject::MessageSent, &bot.id, json!({ "session_id": session.id, "content": content }));
                    }
                    Err(e) => warn!(session_id = %session.id, error = %e, "final reply send failed"),
                }
            }
        }

        self.conversations.tag_assistant_turns(&session.id, &assistant_turn_stamps, &current_model, total_tokens);

        let _ = self.repo.bump_session_stats(&session.id);
        Ok(())
    }

    async fn preprocess_media(&self, message: &Message) -> String {
        let pointer = match &message.media_url {
            Some(url) => url.clone(),
            None => return message.content.clone(),
        };

        let rendered = match message.message_type {
            MessageType::Text => message.content.clone(),
            MessageType::Audio => match self.media.transcribe_audio(&pointer).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "audio transcription failed");
                    "[audio message could not be transcribed]".to_string()
                }
            },
            MessageType::Image => match self.media.describe_image(&pointer).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "image description failed");
                    "[image could not be described]".to_string()
                }
            },
            MessageType::Document => {
                if pointer.to_ascii_lowercase().ends_with(".pdf") {
                    match self.media.extract_pdf_text(&pointer).await {
                        Ok(text) => truncate_pdf_text(&text),
                        Err(e) => {
                            warn!(error = %e, "pdf extraction failed");
                            "[document could not be read]".to_string()
                        }
                    }
                } else {
                    "[unsupported document type]".to_string()
                }
            }
        };

        if !is_remote(&pointer) {
            self.media.delete_local(&pointer).await;
        }

        rendered
    }
}

#[async_trait::async_trait]
impl MessageSink for AIEngine {
    async fn process_messages(&self, session_id: &str, messages: Vec<Message>) {
        if let Err(e) = AIEngine::process_messages(self, session_id, messages).await {
            warn!(session_id, error = %e, "process_messages failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::NoopMediaPipeline;
    use async_trait::async_trait;
    use relaybot_kv::InMemoryKv;
    use relaybot_providers::{ChatResponse, Usage};
    use relaybot_transport::FakeTransport;
    use rusqlite::Connection;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        replies: Vec<&'static str>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl relaybot_providers::LlmProvider for ScriptedProvider {
        fn name(&self) -> &str {
            "scripted"
        }
        async fn chat(&self, _req: &ChatRequest) -> relaybot_providers::Result<ChatResponse> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            let content = self.replies.get(i).copied().unwrap_or("...");
            Ok(ChatResponse { content: Some(content.into()), tool_calls: Vec::new(), usage: Some(Usage::default()), used_fallback: false })
        }
    }

    fn inbound(session_id: &str, content: &str) -> Message {
        Message {
            id: uuid::Uuid::now_v7().to_string(),
            session_id: session_id.into(),
            external_id: Some(uuid::Uuid::now_v7().to_string()),
            sender: "5551234".into(),
            from_me: false,
            content: content.into(),
            message_type: MessageType::Text,
            media_url: None,
            is_processed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    fn make_engine(
        repo: Arc<SqliteRepository>,
        provider: ScriptedProvider,
        transport: Arc<FakeTransport>,
    ) -> AIEngine {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKv::default());
        let conversations = Arc::new(ConversationStore::new(Connection::open_in_memory().unwrap(), 100, 3600, 30).unwrap());
        let tools = Arc::new(ToolRegistry::new(repo.clone()));
        let executor = Arc::new(ToolExecutor::new(repo.clone(), conversations.clone(), transport.clone() as Arc<dyn Transport>));
        let flows = Arc::new(FlowEngine::new(repo.clone(), transport.clone() as Arc<dyn Transport>));
        let mut providers_map: HashMap<ProviderKind, Arc<dyn relaybot_providers::LlmProvider>> = HashMap::new();
        providers_map.insert(ProviderKind::Gemini, Arc::new(provider));
        let providers = Arc::new(ProviderRouter::new(providers_map, HashMap::new()));
        let events = Arc::new(EventBus::new());
        let media: Arc<dyn MediaPipeline> = Arc::new(NoopMediaPipeline);

        AIEngine::new(
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
        )
    }

    fn seed_bot(repo: &SqliteRepository, ai_enabled: bool) -> (Bot, Session) {
        let bot = Bot {
            id: "bot1".into(),
            provider: ProviderKind::Gemini,
            model: "gemini-2.5-flash".into(),
            system_prompt: Some("you are a helpful assistant".into()),
            temperature: 0.7,
            message_delay_ms: 0,
            ignored_labels: Vec::new(),
            exclude_groups: false,
            ai_enabled,
        };
        repo.upsert_bot(&bot).unwrap();
        let session = repo.get_or_create_session(&bot.id, "5551234", None, "whatsapp").unwrap();
        (bot, session)
    }

    #[tokio::test]
    async fn replies_directly_when_model_returns_no_tool_calls() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (_bot, session) = seed_bot(&repo, true);
        let transport = Arc::new(FakeTransport::new());
        let provider = ScriptedProvider { replies: vec!["hola, como puedo ayudarte?"], calls: AtomicUsize::new(0) };
        let engine = make_engine(repo.clone(), provider, transport.clone());

        engine.process_message(&session.id, inbound(&session.id, "hola")).await.unwrap();

        let sent = transport.sent_to("bot1", "5551234");
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            OutboundPayload::Text { text } => assert_eq!(text, "hola, como puedo ayudarte?"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[tokio::test]
    async fn held_lock_enqueues_the_batch_instead_of_calling_the_provider() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (_bot, session) = seed_bot(&repo, true);
        let transport = Arc::new(FakeTransport::new());
        let provider = ScriptedProvider { replies: vec!["should not be reached"], calls: AtomicUsize::new(0) };
        let engine = make_engine(repo.clone(), provider, transport.clone());

        engine.kv.set_if_absent(&lock_key(&session.id), "other-holder", Duration::from_secs(60)).await.unwrap();

        let msg = inbound(&session.id, "hola");
        let msg_id = msg.id.clone();
        engine.process_message(&session.id, msg).await.unwrap();

        assert!(transport.sent_to("bot1", "5551234").is_empty());
        assert_eq!(engine.kv.llen(&pending_key(&session.id)).await.unwrap(), 1);
        let batch = engine.kv.lpop(&pending_key(&session.id)).await.unwrap().unwrap();
        let ids: Vec<String> = serde_json::from_str(&batch).unwrap();
        assert_eq!(ids, vec![msg_id]);
    }

    #[tokio::test]
    async fn ai_disabled_bot_never_calls_the_provider() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let (_bot, session) = seed_bot(&repo, false);
        let transport = Arc::new(FakeTransport::new());
        let provider = ScriptedProvider { replies: vec!["should not be reached"], calls: AtomicUsize::new(0) };
        let engine = make_engine(repo.clone(), provider, transport.clone());

        engine.process_message(&session.id, inbound(&session.id, "hola")).await.unwrap();

        assert!(transport.sent_to("bot1", "5551234").is_empty());
    }
}
