use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// Topic-based in-process pub/sub used to push asynchronous events (e.g.
/// "credits topped up") to connected clients.
///
/// Publish is best-effort and non-blocking from the publisher's
/// perspective: a slow subscriber's bounded sink fills up and further
/// messages for that subscriber are dropped, rather than stalling the
/// publisher or any other subscriber.
#[derive(Clone, Default)]
pub struct Broker {
    topics: Arc<RwLock<HashMap<String, Vec<Subscriber>>>>,
}

#[derive(Clone)]
struct Subscriber {
    id: Uuid,
    tx: mpsc::Sender<String>,
}

/// Handle returned by `subscribe`; dropping it does not unsubscribe —
/// callers must call `unsubscribe` explicitly (or rely on the broker's own
/// pruning of closed channels on the next publish) so a connection's
/// teardown path is always explicit as required by §4.4.
pub struct Subscription {
    pub id: Uuid,
    pub topic: String,
    pub rx: mpsc::Receiver<String>,
}

const SINK_CAPACITY: usize = 1;

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a topic, created lazily if this is the first
    /// subscriber. Returns a bounded sink capacity 1.
    pub async fn subscribe(&self, topic: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        let id = Uuid::new_v4();
        let mut topics = self.topics.write().await;
        topics.entry(topic.to_string()).or_default().push(Subscriber { id, tx });
        Subscription {
            id,
            topic: topic.to_string(),
            rx,
        }
    }

    /// Remove a sink; closes it by dropping the sender.
    pub async fn unsubscribe(&self, topic: &str, id: Uuid) {
        let mut topics = self.topics.write().await;
        if let Some(subs) = topics.get_mut(topic) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                topics.remove(topic);
            }
        }
    }

    /// Iterate current subscribers under a read lock and `try_send` to
    /// each. A full sink means the subscriber is slow; the message is
    /// dropped for that subscriber only, and the publisher never blocks.
    pub async fn publish(&self, topic: &str, msg: impl Into<String>) {
        let msg = msg.into();
        let topics = self.topics.read().await;
        if let Some(subs) = topics.get(topic) {
            for sub in subs {
                match sub.tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(topic, subscriber = %sub.id, "broker: dropping message, subscriber is slow");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        tracing::debug!(topic, subscriber = %sub.id, "broker: subscriber channel closed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn slow_subscriber_drops_without_blocking_publisher() {
        let broker = Broker::new();
        let mut sub = broker.subscribe("topic").await;

        // First publish fills the bounded-1 sink.
        broker.publish("topic", "one").await;
        // Second publish must return promptly, dropping "two".
        let start = std::time::Instant::now();
        broker.publish("topic", "two").await;
        assert!(start.elapsed() < Duration::from_millis(50));

        assert_eq!(sub.rx.recv().await, Some("one".to_string()));
        // "two" was dropped, not queued behind "one".
        let third = tokio::time::timeout(Duration::from_millis(20), sub.rx.recv()).await;
        assert!(third.is_err(), "no further message should have arrived");
    }

    #[tokio::test]
    async fn unsubscribed_sink_receives_nothing_further() {
        let broker = Broker::new();
        let sub = broker.subscribe("topic").await;
        let id = sub.id;
        let mut rx = sub.rx;

        broker.unsubscribe("topic", id).await;
        broker.publish("topic", "late").await;

        let result = rx.recv().await;
        assert_eq!(result, None, "sink should be closed after unsubscribe");
    }

    #[tokio::test]
    async fn publish_to_unknown_topic_is_a_noop() {
        let broker = Broker::new();
        broker.publish("nobody-subscribed", "hello").await;
    }

    #[tokio::test]
    async fn multiple_subscribers_each_get_their_own_drop_budget() {
        let broker = Broker::new();
        let mut sub_a = broker.subscribe("topic").await;
        let mut sub_b = broker.subscribe("topic").await;

        broker.publish("topic", "one").await;
        // Drain only sub_b; sub_a's sink stays full for the next publish.
        assert_eq!(sub_b.rx.recv().await, Some("one".to_string()));

        broker.publish("topic", "two").await;
        assert_eq!(sub_a.rx.recv().await, Some("one".to_string()));
        assert_eq!(sub_b.rx.recv().await, Some("two".to_string()));
    }
}
