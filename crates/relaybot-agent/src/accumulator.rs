//! Per-session debounce buffer (spec.md §4.1, GLOSSARY "Accumulator").
//!
//! Coalesces a burst of inbound messages arriving within `delayMs` of each
//! other into a single batch, handed to a [`MessageSink`] in arrival order.
//! Callers bypass the accumulator entirely when a bot's `message_delay_ms`
//! is 0 — see spec.md §8 "Boundary behaviour".

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use relaybot_core::types::Message;
use tokio::task::JoinHandle;
use tracing::debug;

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn process_messages(&self, session_id: &str, messages: Vec<Message>);
}

struct PendingBatch {
    messages: Vec<Message>,
    timer: JoinHandle<()>,
}

/// Process-local map keyed by session id (spec.md §5 "Shared state").
pub struct Accumulator<S: MessageSink + 'static> {
    pending: Arc<DashMap<String, PendingBatch>>,
    sink: Arc<S>,
}

impl<S: MessageSink + 'static> Accumulator<S> {
    pub fn new(sink: Arc<S>) -> Self {
        Self { pending: Arc::new(DashMap::new()), sink }
    }

    /// Add `message` to the session's burst and (re)arm its debounce timer
    /// (spec.md §4.1: "a new message resets the timer" — a sliding window,
    /// not a fixed one from the first arrival).
    pub fn accumulate(&self, session_id: &str, message: Message, delay_ms: u64) {
        if let Some(mut entry) = self.pending.get_mut(session_id) {
            entry.messages.push(message);
            entry.timer.abort();
            entry.timer = self.spawn_timer(session_id, delay_ms);
            return;
        }

        let timer = self.spawn_timer(session_id, delay_ms);
        self.pending.insert(session_id.to_string(), PendingBatch { messages: vec![message], timer });
    }

    fn spawn_timer(&self, session_id: &str, delay_ms: u64) -> JoinHandle<()> {
        let pending = Arc::clone(&self.pending);
        let sink = Arc::clone(&self.sink);
        let key = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some((_, batch)) = pending.remove(&key) {
                debug!(session_id = %key, count = batch.messages.len(), "flushing accumulated batch");
                sink.process_messages(&key, batch.messages).await;
            }
        })
    }

    /// Number of sessions with an outstanding, unflushed batch (spec.md
    /// §4.1: "the number of buffers with outstanding messages"), not the
    /// size of any single buffer.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Immediately flush every pending session, cancelling their timers.
    /// Used on shutdown so no buffered burst is silently dropped.
    pub async fn flush_all(&self) {
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, batch)) = self.pending.remove(&key) {
                batch.timer.abort();
                self.sink.process_messages(&key, batch.messages).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_core::types::MessageType;
    use std::sync::Mutex;

    fn msg(id: &str) -> Message {
        Message {
            id: id.into(),
            session_id: "s1".into(),
            external_id: Some(id.into()),
            sender: "user".into(),
            from_me: false,
            content: id.into(),
            message_type: MessageType::Text,
            media_url: None,
            is_processed: false,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    struct RecordingSink {
        batches: Mutex<Vec<Vec<Message>>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn process_messages(&self, _session_id: &str, messages: Vec<Message>) {
            self.batches.lock().unwrap().push(messages);
        }
    }

    #[tokio::test]
    async fn three_arrivals_within_window_yield_one_batch_in_order() {
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let acc = Accumulator::new(Arc::clone(&sink));

        acc.accumulate("s1", msg("a"), 40);
        acc.accumulate("s1", msg("b"), 40);
        acc.accumulate("s1", msg("c"), 40);
        assert_eq!(acc.pending_count(), 1);

        tokio::time::sleep(Duration::from_millis(80)).await;

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<&str> = batches[0].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    /// A later arrival must push the flush out by another `delay_ms`, not
    /// just extend the batch under a timer still counting down from the
    /// first arrival (spec.md §4.1 sliding window).
    #[tokio::test]
    async fn later_arrival_resets_the_debounce_window() {
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let acc = Accumulator::new(Arc::clone(&sink));

        acc.accumulate("s1", msg("a"), 60);
        // Sleep past what would have been the original deadline, then
        // arrive again: under a fixed-window bug this flushes with only
        // "a"; under a sliding window it resets and "b" joins the batch.
        tokio::time::sleep(Duration::from_millis(40)).await;
        acc.accumulate("s1", msg("b"), 60);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sink.batches.lock().unwrap().is_empty(), "timer should have been reset, not fired yet");

        tokio::time::sleep(Duration::from_millis(60)).await;
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        let ids: Vec<&str> = batches[0].iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn flush_all_delivers_pending_batches_immediately() {
        let sink = Arc::new(RecordingSink { batches: Mutex::new(Vec::new()) });
        let acc = Accumulator::new(Arc::clone(&sink));
        acc.accumulate("s1", msg("a"), 60_000);
        acc.flush_all().await;
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
        assert_eq!(acc.pending_count(), 0);
    }
}
