//! Per-chat sequenced pub/sub.
//!
//! Every chat has its own topic: a monotonically increasing sequence counter
//! and a set of bounded subscriber queues. Publishing never blocks; a
//! subscriber whose queue is full is evicted so one stalled SSE connection
//! can never back-pressure the agent loop. The bus holds no history — late
//! subscribers only see events published after they subscribed.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::events::{ChatEvent, ChatEventKind};
use crate::ids::utc_now_iso;

const MAX_SUB_QUEUE: usize = 200;

struct Topic {
    sequence: u64,
    subscribers: Vec<(u64, mpsc::Sender<ChatEvent>)>,
}

impl Topic {
    fn new() -> Self {
        Self {
            sequence: 0,
            subscribers: Vec::new(),
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]; pass the token back to
/// [`EventBus::unsubscribe`] when the consumer goes away. Dropping the
/// receiver also works — the next publish prunes closed queues.
pub struct Subscription {
    pub token: u64,
    pub receiver: mpsc::Receiver<ChatEvent>,
}

pub struct EventBus {
    topics: Mutex<HashMap<String, Topic>>,
    next_token: Mutex<u64>,
    queue_capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(MAX_SUB_QUEUE)
    }

    pub fn with_capacity(queue_capacity: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            next_token: Mutex::new(1),
            queue_capacity,
        }
    }

    /// Register a bounded queue for a chat.
    pub fn subscribe(&self, chat_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let token = {
            let mut next = self.next_token.lock();
            let token = *next;
            *next += 1;
            token
        };
        let mut topics = self.topics.lock();
        topics
            .entry(chat_id.to_string())
            .or_insert_with(Topic::new)
            .subscribers
            .push((token, tx));
        Subscription {
            token,
            receiver: rx,
        }
    }

    /// Remove a subscriber; drops the chat topic when it was the last one
    /// and no events were ever published.
    pub fn unsubscribe(&self, chat_id: &str, token: u64) {
        let mut topics = self.topics.lock();
        if let Some(topic) = topics.get_mut(chat_id) {
            topic.subscribers.retain(|(t, _)| *t != token);
            if topic.subscribers.is_empty() && topic.sequence == 0 {
                topics.remove(chat_id);
            }
        }
    }

    /// Stamp the event with chat id, timestamp and the next sequence number,
    /// then push it to every subscriber. Full or closed queues are evicted.
    pub fn publish(&self, chat_id: &str, kind: ChatEventKind) -> ChatEvent {
        let mut topics = self.topics.lock();
        let topic = topics
            .entry(chat_id.to_string())
            .or_insert_with(Topic::new);
        topic.sequence += 1;
        let event = ChatEvent {
            kind,
            chat_id: chat_id.to_string(),
            timestamp: utc_now_iso(),
            sequence: topic.sequence,
        };

        topic.subscribers.retain(|(token, tx)| {
            match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!(
                        "evicting slow subscriber {} on chat {} at seq {}",
                        token,
                        chat_id,
                        event.sequence
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        });

        event
    }

    pub fn subscriber_count(&self, chat_id: &str) -> usize {
        self.topics
            .lock()
            .get(chat_id)
            .map(|t| t.subscribers.len())
            .unwrap_or(0)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(text: &str) -> ChatEventKind {
        ChatEventKind::ContentDelta {
            message_id: "msg-1".into(),
            delta: text.into(),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("chat-1");

        bus.publish("chat-1", delta("a"));

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.chat_id, "chat-1");
        assert_eq!(event.sequence, 1);
    }

    #[tokio::test]
    async fn sequence_is_monotonic_per_chat() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("chat-1");

        for text in ["a", "b", "c"] {
            bus.publish("chat-1", delta(text));
        }
        // An unrelated chat does not advance this chat's counter.
        bus.publish("chat-2", delta("x"));
        bus.publish("chat-1", delta("d"));

        let mut last = 0;
        for _ in 0..4 {
            let event = sub.receiver.recv().await.unwrap();
            assert!(event.sequence > last);
            last = event.sequence;
        }
        assert_eq!(last, 4);
    }

    #[tokio::test]
    async fn late_subscriber_misses_prior_events() {
        let bus = EventBus::new();
        bus.publish("chat-1", delta("early"));

        let mut sub = bus.subscribe("chat-1");
        bus.publish("chat-1", delta("late"));

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.sequence, 2);
        assert!(sub.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_not_blocked() {
        let bus = EventBus::with_capacity(2);
        let _sub = bus.subscribe("chat-1");
        assert_eq!(bus.subscriber_count("chat-1"), 1);

        // Fill the queue past capacity; the publisher must not block and
        // the subscriber must be gone afterwards.
        for i in 0..4 {
            bus.publish("chat-1", delta(&i.to_string()));
        }
        assert_eq!(bus.subscriber_count("chat-1"), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_publish() {
        let bus = EventBus::new();
        let sub = bus.subscribe("chat-1");
        drop(sub);
        bus.publish("chat-1", delta("x"));
        assert_eq!(bus.subscriber_count("chat-1"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_removes_only_that_queue() {
        let bus = EventBus::new();
        let sub1 = bus.subscribe("chat-1");
        let mut sub2 = bus.subscribe("chat-1");
        bus.unsubscribe("chat-1", sub1.token);
        assert_eq!(bus.subscriber_count("chat-1"), 1);

        bus.publish("chat-1", delta("still here"));
        assert!(sub2.receiver.recv().await.is_some());
    }

    #[tokio::test]
    async fn multiple_subscribers_see_identical_events() {
        let bus = EventBus::new();
        let mut a = bus.subscribe("chat-1");
        let mut b = bus.subscribe("chat-1");

        bus.publish("chat-1", delta("shared"));

        let ea = a.receiver.recv().await.unwrap();
        let eb = b.receiver.recv().await.unwrap();
        assert_eq!(ea.sequence, eb.sequence);
        assert_eq!(
            serde_json::to_string(&ea).unwrap(),
            serde_json::to_string(&eb).unwrap()
        );
    }
}
