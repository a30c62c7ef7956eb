use std::sync::Arc;
use std::time::Duration;

use relaybot_core::types::StepType;
use relaybot_store::SqliteRepository;
use relaybot_transport::{OutboundPayload, Transport};
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::matcher::TriggerMatcher;

/// Evaluates triggers against a message and runs the matched flow to
/// completion (spec.md §4.7).
pub struct FlowEngine {
    repo: Arc<SqliteRepository>,
    transport: Arc<dyn Transport>,
    matcher: TriggerMatcher,
}

impl FlowEngine {
    pub fn new(repo: Arc<SqliteRepository>, transport: Arc<dyn Transport>) -> Self {
        Self { repo, transport, matcher: TriggerMatcher::new() }
    }

    /// Find the first trigger whose scope and match type accept this
    /// message, and start an execution for its flow. Returns the execution
    /// id, if one was started.
    #[instrument(skip(self, content), fields(bot_id, session_id))]
    pub fn evaluate(
        &self,
        bot_id: &str,
        session_id: &str,
        content: &str,
        from_me: bool,
    ) -> Result<Option<String>> {
        let triggers = self.repo.triggers_for_bot(bot_id)?;
        let Some(trigger) = triggers.iter().find(|t| self.matcher.matches(t, content, from_me)) else {
            return Ok(None);
        };

        let execution_id = self.repo.create_execution(&trigger.flow_id, session_id)?;
        info!(bot_id, session_id, flow_id = %trigger.flow_id, execution_id, "trigger matched, starting flow");
        Ok(Some(execution_id))
    }

    /// Evaluate triggers and, if one matches, drive its flow to completion in
    /// the background. Combines `evaluate` + `run_execution` for callers that
    /// only care whether a flow was started, not its intermediate flow_id
    /// (the AI engine's `ai_enabled == false` bypass, spec.md §4.6 step 2).
    pub fn evaluate_and_run(
        self: &Arc<Self>,
        bot_id: &str,
        session_id: &str,
        identifier: &str,
        content: &str,
        from_me: bool,
    ) -> Result<Option<String>> {
        let triggers = self.repo.triggers_for_bot(bot_id)?;
        let Some(trigger) = triggers.iter().find(|t| self.matcher.matches(t, content, from_me)) else {
            return Ok(None);
        };

        let execution_id = self.repo.create_execution(&trigger.flow_id, session_id)?;
        info!(bot_id, session_id, flow_id = %trigger.flow_id, execution_id, "trigger matched, starting flow");

        let engine = Arc::clone(self);
        let flow_id = trigger.flow_id.clone();
        let bot_id = bot_id.to_string();
        let identifier = identifier.to_string();
        let execution_id_spawn = execution_id.clone();
        tokio::spawn(async move {
            engine.run_execution(&execution_id_spawn, &flow_id, &bot_id, &identifier).await;
        });

        Ok(Some(execution_id))
    }

    /// Run every step of `flow_id` in order, sleeping `delay_ms` (+ small
    /// jitter) between sends. Terminates early — marking the execution
    /// FAILED — if the session no longer exists.
    pub async fn run_execution(&self, execution_id: &str, flow_id: &str, bot_id: &str, identifier: &str) {
        let flow = match self.repo.get_flow(flow_id) {
            Ok(Some(f)) => f,
            Ok(None) => {
                warn!(execution_id, flow_id, "flow vanished before execution could run");
                let _ = self.repo.finish_execution(execution_id, false);
                return;
            }
            Err(e) => {
                warn!(execution_id, flow_id, error = %e, "failed to load flow");
                let _ = self.repo.finish_execution(execution_id, false);
                return;
            }
        };

        let mut steps = flow.steps.clone();
        steps.sort_by_key(|s| s.order);

        for step in &steps {
            let payload = match step.step_type {
                StepType::Text => OutboundPayload::text(step.content.clone().unwrap_or_default()),
                StepType::Image => OutboundPayload::Image {
                    url: step.media_url.clone().unwrap_or_default(),
                    caption: step.content.clone(),
                },
                StepType::Audio => OutboundPayload::Audio { url: step.media_url.clone().unwrap_or_default(), ptt: false },
                StepType::Ptt => OutboundPayload::Audio { url: step.media_url.clone().unwrap_or_default(), ptt: true },
            };
            if let Err(e) = self.transport.send_message(bot_id, identifier, payload).await {
                warn!(execution_id, bot_id, error = %e, "flow step send failed, aborting execution");
                let _ = self.repo.finish_execution(execution_id, false);
                return;
            }
            let _ = self.repo.advance_execution(execution_id, step.order);
            if step.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(step.delay_ms + jitter_ms(step.delay_ms))).await;
            }
        }

        let _ = self.repo.finish_execution(execution_id, true);
    }
}

fn jitter_ms(base_ms: u64) -> u64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let max_jitter = base_ms / 10;
    if max_jitter == 0 {
        return 0;
    }
    (nanos as u64) % max_jitter
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_core::types::{Step, StepType, TriggerMatchType, TriggerScope};
    use relaybot_transport::FakeTransport;

    #[tokio::test]
    async fn matched_trigger_starts_and_completes_execution() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let transport = Arc::new(FakeTransport::new());
        let flow = repo
            .create_flow(
                "b1",
                "greeting",
                &[Step { order: 0, step_type: StepType::Text, content: Some("hola!".into()), media_url: None, delay_ms: 0 }],
            )
            .unwrap();
        repo.create_trigger("b1", &flow.id, "hola", TriggerMatchType::Contains, TriggerScope::Incoming).unwrap();

        let engine = FlowEngine::new(repo.clone(), transport.clone());
        let execution_id = engine.evaluate("b1", "sess1", "hola bot", false).unwrap().unwrap();
        engine.run_execution(&execution_id, &flow.id, "b1", "555").await;

        assert_eq!(transport.sent_to("b1", "555").len(), 1);
    }

    #[test]
    fn outgoing_message_does_not_match_incoming_only_trigger() {
        let repo = Arc::new(SqliteRepository::open_in_memory().unwrap());
        let transport = Arc::new(FakeTransport::new());
        let flow = repo.create_flow("b1", "greeting", &[]).unwrap();
        repo.create_trigger("b1", &flow.id, "hola", TriggerMatchType::Contains, TriggerScope::Incoming).unwrap();

        let engine = FlowEngine::new(repo, transport);
        assert!(engine.evaluate("b1", "sess1", "hola", true).unwrap().is_none());
    }
}
