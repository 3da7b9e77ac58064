//! In-memory subscription fan-out (spec §4.2, SPEC_FULL §9.1, §9.10).
//!
//! Subscriptions are per-process, not durable — a reconnecting device
//! re-subscribes and catches up via `conv.subscribe`'s `from_seq`/cursor.
//! One conversation can have many device subscribers. The channel doubles
//! as the connection's bounded outbound queue: a full queue means the
//! consumer is too slow, and the subscriber is dropped rather than letting
//! one slow reader stall the broadcaster for everyone else — the
//! connection handler observes the closed sender and closes with
//! `backpressure`.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::conversation_log::ConversationEvent;

#[derive(Clone)]
struct Subscriber {
    device_id: String,
    tx: mpsc::Sender<ConversationEvent>,
}

#[derive(Clone)]
pub struct SubscriptionHub {
    subscriptions: Arc<DashMap<String, Vec<Subscriber>>>,
    queue_capacity: usize,
}

/// A handle returned from [`SubscriptionHub::subscribe`]; pass it to
/// [`SubscriptionHub::unsubscribe`] when the connection drops.
pub struct Subscription {
    pub conv_id: String,
    pub device_id: String,
}

impl SubscriptionHub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            subscriptions: Arc::new(DashMap::new()),
            queue_capacity: queue_capacity.max(1),
        }
    }

    pub fn subscribe(
        &self,
        device_id: &str,
        conv_id: &str,
    ) -> (Subscription, mpsc::Receiver<ConversationEvent>) {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.subscriptions
            .entry(conv_id.to_string())
            .or_default()
            .push(Subscriber {
                device_id: device_id.to_string(),
                tx,
            });
        (
            Subscription {
                conv_id: conv_id.to_string(),
                device_id: device_id.to_string(),
            },
            rx,
        )
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        if let Some(mut subs) = self.subscriptions.get_mut(&subscription.conv_id) {
            subs.retain(|s| s.device_id != subscription.device_id);
        }
        if self
            .subscriptions
            .get(&subscription.conv_id)
            .is_some_and(|subs| subs.is_empty())
        {
            self.subscriptions.remove(&subscription.conv_id);
        }
    }

    /// Deliver `event` to every live subscriber of its conversation. A
    /// subscriber whose queue is full or whose receiver is gone is pruned;
    /// the connection handler is responsible for noticing its channel
    /// closed and tearing the connection down with `backpressure`.
    pub fn broadcast(&self, event: ConversationEvent) {
        let Some(mut subs) = self.subscriptions.get_mut(&event.conv_id) else {
            return;
        };
        subs.retain(|sub| sub.tx.try_send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self, conv_id: &str) -> usize {
        self.subscriptions.get(conv_id).map(|s| s.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(conv_id: &str, seq: i64) -> ConversationEvent {
        ConversationEvent {
            conv_id: conv_id.to_string(),
            seq,
            msg_id: format!("m{seq}"),
            env_b64: "AA".to_string(),
            sender_device_id: "sender".to_string(),
            ts_ms: 0,
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_subscribers_of_a_conversation() {
        let hub = SubscriptionHub::new(8);
        let (_sub_a, mut rx_a) = hub.subscribe("devA", "c1");
        let (_sub_b, mut rx_b) = hub.subscribe("devB", "c1");
        hub.broadcast(event("c1", 1));
        assert_eq!(rx_a.recv().await.unwrap().seq, 1);
        assert_eq!(rx_b.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn broadcast_does_not_cross_conversations() {
        let hub = SubscriptionHub::new(8);
        let (_sub, mut rx) = hub.subscribe("devA", "c1");
        hub.broadcast(event("c2", 1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let hub = SubscriptionHub::new(8);
        let (sub, mut rx) = hub.subscribe("devA", "c1");
        hub.unsubscribe(&sub);
        hub.broadcast(event("c1", 1));
        assert!(rx.try_recv().is_err());
        assert_eq!(hub.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_is_pruned_on_next_broadcast() {
        let hub = SubscriptionHub::new(8);
        let (_sub, rx) = hub.subscribe("devA", "c1");
        drop(rx);
        hub.broadcast(event("c1", 1));
        assert_eq!(hub.subscriber_count("c1"), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_the_slow_subscriber() {
        let hub = SubscriptionHub::new(1);
        let (_sub, _rx) = hub.subscribe("devA", "c1");
        hub.broadcast(event("c1", 1));
        hub.broadcast(event("c1", 2)); // queue full, subscriber pruned
        assert_eq!(hub.subscriber_count("c1"), 0);
    }
}
