use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::transport::Transport;
use crate::types::{ConnectionStatus, OutboundPayload, Presence, RemoteLabel};

/// A process-local stand-in for a real WhatsApp transport, used by this
/// workspace's own tests (ToolExecutor, FlowEngine, AIEngine). Never talks to
/// a network; just records what it was asked to do.
#[derive(Default)]
pub struct FakeTransport {
    pub sent: DashMap<String, Vec<OutboundPayload>>,
    pub labels_added: DashMap<String, Vec<String>>,
    pub labels_removed: DashMap<String, Vec<String>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent_to(&self, bot_id: &str, identifier: &str) -> Vec<OutboundPayload> {
        self.sent
            .get(&format!("{bot_id}:{identifier}"))
            .map(|v| v.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_session(&self, _bot_id: &str) -> Result<()> {
        Ok(())
    }

    async fn stop_session(&self, _bot_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send_message(&self, bot_id: &str, identifier: &str, payload: OutboundPayload) -> Result<()> {
        self.sent
            .entry(format!("{bot_id}:{identifier}"))
            .or_default()
            .push(payload);
        Ok(())
    }

    async fn mark_read(&self, _bot_id: &str, _identifier: &str, _external_id: &str) -> Result<()> {
        Ok(())
    }

    async fn send_presence(&self, _bot_id: &str, _identifier: &str, _presence: Presence) -> Result<()> {
        Ok(())
    }

    async fn add_chat_label(&self, bot_id: &str, identifier: &str, wa_label_id: &str) -> Result<()> {
        self.labels_added
            .entry(format!("{bot_id}:{identifier}"))
            .or_default()
            .push(wa_label_id.to_string());
        Ok(())
    }

    async fn remove_chat_label(&self, bot_id: &str, identifier: &str, wa_label_id: &str) -> Result<()> {
        self.labels_removed
            .entry(format!("{bot_id}:{identifier}"))
            .or_default()
            .push(wa_label_id.to_string());
        Ok(())
    }

    async fn sync_labels(&self, _bot_id: &str) -> Result<Vec<RemoteLabel>> {
        Ok(Vec::new())
    }

    fn status(&self, _bot_id: &str) -> ConnectionStatus {
        ConnectionStatus::Connected
    }

    async fn shutdown_all(&self) -> Result<()> {
        Ok(())
    }
}
