use async_trait::async_trait;
use fred::clients::RedisClient;
use fred::interfaces::{EventInterface, PubsubInterface};
use serde_json::Value;

use crate::{BusError, BusSubscription, PubSubBus};

/// `fred`-backed `PubSubBus`, matching `RedisContextStore`'s client-wrapping
/// idiom. One `RedisClient` handles both publishing and every subscription
/// made through it — `fred` multiplexes subscribed channels onto a single
/// connection and fans incoming messages out over `message_rx()`, which
/// `subscribe` filters down to the requested channel.
pub struct RedisBus {
    client: RedisClient,
}

impl RedisBus {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PubSubBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError> {
        let body = serde_json::to_string(&payload)?;
        self.client
            .publish::<i64, _, _>(channel, body)
            .await
            .map_err(|e| BusError::Redis(e.to_string()))?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError> {
        self.client
            .subscribe(channel)
            .await
            .map_err(|e| BusError::Redis(e.to_string()))?;
        Ok(BusSubscription::Redis {
            receiver: self.client.message_rx(),
            channel: channel.to_string(),
        })
    }
}
