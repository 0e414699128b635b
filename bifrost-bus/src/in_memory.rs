use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::{BusError, BusSubscription, PubSubBus};

const CHANNEL_CAPACITY: usize = 256;

/// Single-process pub/sub over `tokio::sync::broadcast`, one channel per
/// named topic. Suitable for tests and for a single-node deployment that
/// doesn't need cross-process fan-out (see `RedisBus` for that).
pub struct InMemoryBus {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<Value> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PubSubBus for InMemoryBus {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError> {
        // A send with no subscribers is not an error: broadcast has no
        // queueing, so a message published to an empty channel is simply
        // gone, matching the no-queueing semantics the bus promises.
        let _ = self.sender(channel).send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        Ok(BusSubscription::Broadcast(self.sender(channel).subscribe()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test_r::test(tokio::test)]
    async fn subscriber_receives_published_payload() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("worker:heartbeat").await.unwrap();
        bus.publish("worker:heartbeat", json!({"type": "heartbeat", "worker_id": "w1"}))
            .await
            .unwrap();
        let received = sub.recv().await.unwrap();
        assert_eq!(received["worker_id"], "w1");
    }

    #[test_r::test(tokio::test)]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = InMemoryBus::new();
        bus.publish("cancel", json!({"type": "cancel", "execution_id": "e1"}))
            .await
            .unwrap();
    }

    #[test_r::test(tokio::test)]
    async fn channels_are_isolated() {
        let bus = InMemoryBus::new();
        let mut heartbeat_sub = bus.subscribe("worker:heartbeat").await.unwrap();
        bus.publish("worker:scaling", json!({"type": "scale_up"}))
            .await
            .unwrap();
        bus.publish("worker:heartbeat", json!({"type": "heartbeat"}))
            .await
            .unwrap();
        let received = heartbeat_sub.recv().await.unwrap();
        assert_eq!(received["type"], "heartbeat");
    }
}
