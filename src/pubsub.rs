//! Pub/sub channel registry and per-connection subscription state
//! (spec §3, §4.2).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};

use crate::resp::Value;

/// Commands a connection in subscribed mode is still allowed to run
/// (spec §3, §4.5 routing rule 1), plus RESET which this implementation
/// always accepts (§4.2a).
pub const SUBSCRIBED_MODE_ALLOW_LIST: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
    "RESET",
];

/// Per-connection subscription set.
#[derive(Debug, Default)]
pub struct Subscription {
    channels: HashSet<String>,
}

impl Subscription {
    pub fn is_subscribed_mode(&self) -> bool {
        !self.channels.is_empty()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn add(&mut self, channel: &str) -> bool {
        self.channels.insert(channel.to_string())
    }

    pub fn remove(&mut self, channel: &str) -> bool {
        self.channels.remove(channel)
    }

    pub fn clear(&mut self) {
        self.channels.clear();
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().cloned().collect()
    }
}

/// Global channel -> subscriber registry. Mirrors the teacher's
/// registry-of-handles style in `replication_config.rs` (a `Vec` of
/// per-connection output handles keyed by address), applied here to
/// pub/sub channels keyed by connection id.
#[derive(Default)]
pub struct PubSub {
    channels: RwLock<HashMap<String, Vec<(u64, mpsc::Sender<Value>)>>>,
}

impl PubSub {
    pub fn new() -> Arc<Self> {
        Arc::new(PubSub::default())
    }

    pub async fn subscribe(&self, channel: &str, conn_id: u64, sender: mpsc::Sender<Value>) {
        let mut channels = self.channels.write().await;
        let subscribers = channels.entry(channel.to_string()).or_default();
        if !subscribers.iter().any(|(id, _)| *id == conn_id) {
            subscribers.push((conn_id, sender));
        }
    }

    pub async fn unsubscribe(&self, channel: &str, conn_id: u64) {
        let mut channels = self.channels.write().await;
        if let Some(subscribers) = channels.get_mut(channel) {
            subscribers.retain(|(id, _)| *id != conn_id);
            if subscribers.is_empty() {
                channels.remove(channel);
            }
        }
    }

    pub async fn unsubscribe_all(&self, conn_id: u64, channels_to_drop: &[String]) {
        for channel in channels_to_drop {
            self.unsubscribe(channel, conn_id).await;
        }
    }

    /// Publishes `payload` to every subscriber of `channel`, returning the
    /// count of connections it was delivered to. A subscriber whose
    /// channel has gone away (receiver dropped) simply doesn't count;
    /// cleanup of that stale entry happens on the subscriber's own
    /// disconnect path.
    pub async fn publish(&self, channel: &str, payload: &str) -> i64 {
        let channels = self.channels.read().await;
        let Some(subscribers) = channels.get(channel) else {
            return 0;
        };
        let message = Value::Array(vec![
            Value::bulk_str("message"),
            Value::bulk_str(channel),
            Value::bulk_str(payload),
        ]);
        let mut delivered = 0i64;
        for (_, sender) in subscribers {
            if sender.send(message.clone()).await.is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_all_subscribers_and_counts_them() {
        let pubsub = PubSub::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        pubsub.subscribe("ch", 1, tx1).await;
        pubsub.subscribe("ch", 2, tx2).await;

        let count = pubsub.publish("ch", "hello").await;
        assert_eq!(count, 2);

        let msg1 = rx1.recv().await.unwrap();
        let msg2 = rx2.recv().await.unwrap();
        assert_eq!(
            msg1,
            Value::Array(vec![
                Value::bulk_str("message"),
                Value::bulk_str("ch"),
                Value::bulk_str("hello"),
            ])
        );
        assert_eq!(msg1, msg2);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let pubsub = PubSub::new();
        let (tx, _rx) = mpsc::channel(8);
        pubsub.subscribe("ch", 1, tx).await;
        pubsub.unsubscribe("ch", 1).await;
        assert_eq!(pubsub.publish("ch", "x").await, 0);
    }

    #[test]
    fn subscription_tracks_mode_and_count() {
        let mut sub = Subscription::default();
        assert!(!sub.is_subscribed_mode());
        sub.add("a");
        sub.add("b");
        assert!(sub.is_subscribed_mode());
        assert_eq!(sub.channel_count(), 2);
        sub.remove("a");
        assert_eq!(sub.channel_count(), 1);
        sub.remove("b");
        assert!(!sub.is_subscribed_mode());
    }
}
