//! In-process topic broker.
//!
//! Tenant sessions subscribe with MQTT-style filters; every publish is fanned
//! out to each session with at least one matching filter. Deliveries go
//! through one unbounded channel per session, so publish order is preserved
//! per subscriber and a slow tenant can never block another tenant's session.

use relaygate_core::topic;
use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// One payload delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
}

struct Subscription {
    filters: Vec<String>,
    tx: mpsc::UnboundedSender<Delivery>,
}

/// Subscriptions indexed by tenant connection id.
#[derive(Default)]
pub struct Broker {
    subscriptions: RwLock<HashMap<u64, Subscription>>,
}

impl Broker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `filter` for `conn_id`, delivering into `tx`.
    pub async fn subscribe(&self, conn_id: u64, filter: String, tx: mpsc::UnboundedSender<Delivery>) {
        let mut subs = self.subscriptions.write().await;
        let sub = subs.entry(conn_id).or_insert_with(|| Subscription {
            filters: Vec::new(),
            tx: tx.clone(),
        });
        sub.tx = tx;
        if !sub.filters.contains(&filter) {
            debug!(conn_id, filter = %filter, "subscribed");
            sub.filters.push(filter);
        }
    }

    pub async fn unsubscribe_all(&self, conn_id: u64) {
        if self.subscriptions.write().await.remove(&conn_id).is_some() {
            debug!(conn_id, "subscriptions dropped");
        }
    }

    /// Deliver `payload` to every matching subscriber. Returns the number of
    /// subscribers reached.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> usize {
        let subs = self.subscriptions.read().await;
        let mut delivered = 0;
        for (conn_id, sub) in subs.iter() {
            if !sub.filters.iter().any(|f| topic::matches(f, topic)) {
                continue;
            }
            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            };
            if sub.tx.send(delivery).is_ok() {
                delivered += 1;
            } else {
                debug!(conn_id = *conn_id, topic = %topic, "subscriber gone");
            }
        }
        delivered
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscriptions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_only_to_matching_filters() {
        let broker = Broker::new();
        let (alice_tx, mut alice_rx) = mpsc::unbounded_channel();
        let (bob_tx, mut bob_rx) = mpsc::unbounded_channel();
        broker.subscribe(1, topic::web_filter("alice"), alice_tx.clone()).await;
        broker.subscribe(1, topic::msg_filter("alice"), alice_tx).await;
        broker.subscribe(2, topic::web_filter("bob"), bob_tx).await;

        assert_eq!(broker.publish("web/alice/s1", b"GET").await, 1);
        assert_eq!(broker.publish("msg/alice/bob", b"hi").await, 1);
        assert_eq!(broker.publish("msg/carol/bob", b"hi").await, 0);

        assert_eq!(alice_rx.recv().await.unwrap().topic, "web/alice/s1");
        assert_eq!(alice_rx.recv().await.unwrap().payload, b"hi");
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn preserves_order_per_subscriber() {
        let broker = Broker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(7, topic::web_filter("h"), tx).await;
        for i in 0..10u8 {
            broker.publish("web/h/s", &[i]).await;
        }
        for i in 0..10u8 {
            assert_eq!(rx.recv().await.unwrap().payload, vec![i]);
        }
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let broker = Broker::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        broker.subscribe(3, topic::web_filter("h"), tx).await;
        broker.unsubscribe_all(3).await;
        assert_eq!(broker.publish("web/h/s", b"x").await, 0);
        assert_eq!(broker.subscriber_count().await, 0);
    }
}
