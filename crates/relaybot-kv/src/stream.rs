//! Outbound fan-out stream contract (spec.md §6).
//!
//! Real deployments use a Redis stream (`agentic:queue:outgoing`, consumer
//! group `node_gateway_group`). No consumer binary ships in this crate —
//! see SPEC_FULL.md Open Question 1 — but the trait is defined so a
//! deployment can plug one in without touching `relaybot-agent`.

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;

#[async_trait]
pub trait OutboundStream: Send + Sync {
    /// Publish one payload (bounded length, `MAXLEN ~ 10000` upstream).
    async fn publish(&self, payload: Value) -> Result<()>;

    /// Read the next unacknowledged payload for `consumer_group`, if any.
    async fn read_one(&self, consumer_group: &str) -> Result<Option<(String, Value)>>;

    /// Acknowledge delivery, including poison pills (spec.md §6).
    async fn ack(&self, id: &str) -> Result<()>;
}

/// In-memory stand-in: a single FIFO queue, "groups" are all equivalent.
#[derive(Default)]
pub struct InMemoryStream {
    queue: Mutex<Vec<(String, Value)>>,
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboundStream for InMemoryStream {
    async fn publish(&self, payload: Value) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        self.queue.lock().await.push((id, payload));
        Ok(())
    }

    async fn read_one(&self, _consumer_group: &str) -> Result<Option<(String, Value)>> {
        let mut q = self.queue.lock().await;
        if q.is_empty() {
            Ok(None)
        } else {
            Ok(Some(q.remove(0)))
        }
    }

    async fn ack(&self, _id: &str) -> Result<()> {
        // Entries are removed from the queue at read time in this
        // in-memory stand-in; a Redis-backed implementation would XACK here.
        Ok(())
    }
}
