use tokio::sync::broadcast;
use tracing::debug;

use crate::types::{Event, Subject};

const BROADCAST_CAPACITY: usize = 256;

/// In-process typed publisher/subscriber (spec.md §4.9).
///
/// No persistence, no backpressure beyond a subscriber's own queue — a slow
/// subscriber drops events once it falls `BROADCAST_CAPACITY` behind, it is
/// never allowed to stall a publisher.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    pub fn emit(&self, event: Event) {
        debug!(subject = ?event.subject, bot_id = %event.bot_id, "event emitted");
        let _ = self.tx.send(event);
    }

    pub fn emit_json(&self, subject: Subject, bot_id: impl Into<String>, payload: serde_json::Value) {
        self.emit(Event::new(subject, bot_id, payload));
    }

    /// Subscribe to the whole stream; the receiver filters for itself.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Subscribe filtered to a single `bot_id`. Lagged events are skipped,
    /// not surfaced as an error — a subscriber that falls behind resumes
    /// from whatever is next available rather than terminating.
    pub fn subscribe_for_bot(&self, bot_id: impl Into<String>) -> BotSubscription {
        BotSubscription { rx: self.tx.subscribe(), bot_id: bot_id.into() }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BotSubscription {
    rx: broadcast::Receiver<Event>,
    bot_id: String,
}

impl BotSubscription {
    /// Await the next event matching this subscription's `bot_id`, skipping
    /// events for other bots and tolerating lag without erroring.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.bot_id == self.bot_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscriber_receives_matching_bot_events_only() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_for_bot("b1");

        bus.emit_json(Subject::MessageSent, "b2", json!({"x": 1}));
        bus.emit_json(Subject::MessageSent, "b1", json!({"x": 2}));

        let event = sub.recv().await.unwrap();
        assert_eq!(event.bot_id, "b1");
        assert_eq!(event.payload["x"], 2);
    }

    #[tokio::test]
    async fn no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.emit_json(Subject::SystemLog, "b1", json!({}));
    }

    #[tokio::test]
    async fn closed_bus_returns_none() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe_for_bot("b1");
        drop(bus);
        assert!(sub.recv().await.is_none());
    }
}
