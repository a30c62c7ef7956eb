use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConnectionStatus, OutboundPayload, Presence, RemoteLabel};

/// The WhatsApp-shaped transport interface the core depends on (spec.md §6
/// "Transport"). Implementing the protocol itself — QR pairing, media
/// download, the actual wire client — is out of scope; this crate only owns
/// the contract and the reconnect/session bookkeeping around it.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Begin (or resume) a session for `bot_id`, e.g. pairing a device.
    async fn start_session(&self, bot_id: &str) -> Result<()>;

    /// Tear down the session for `bot_id`.
    async fn stop_session(&self, bot_id: &str) -> Result<()>;

    async fn send_message(&self, bot_id: &str, identifier: &str, payload: OutboundPayload) -> Result<()>;

    async fn mark_read(&self, bot_id: &str, identifier: &str, external_id: &str) -> Result<()>;

    async fn send_presence(&self, bot_id: &str, identifier: &str, presence: Presence) -> Result<()>;

    async fn add_chat_label(&self, bot_id: &str, identifier: &str, wa_label_id: &str) -> Result<()>;

    async fn remove_chat_label(&self, bot_id: &str, identifier: &str, wa_label_id: &str) -> Result<()>;

    async fn sync_labels(&self, bot_id: &str) -> Result<Vec<RemoteLabel>>;

    fn status(&self, bot_id: &str) -> ConnectionStatus;

    /// Close every session this transport owns. Called once, at shutdown.
    async fn shutdown_all(&self) -> Result<()>;
}
