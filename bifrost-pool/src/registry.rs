use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use fred::interfaces::{ExpireInterface, HashesInterface, KeysInterface};

/// Where a pool's liveness record lives (`bifrost:pool:<worker_id>` as a
/// hash with a TTL, per §4.10's heartbeat/registration step). Kept
/// separate from `bifrost-context`'s `ContextStore` because it stores
/// pool metadata, not execution state, even though both ultimately live
/// in the same Redis instance in production.
#[async_trait]
pub trait PoolRegistry: Send + Sync {
    async fn register(&self, worker_id: &str, fields: HashMap<String, String>, ttl: Duration);

    async fn refresh_ttl(&self, worker_id: &str, ttl: Duration);

    async fn update_fields(&self, worker_id: &str, fields: HashMap<String, String>);

    async fn unregister(&self, worker_id: &str);
}

fn registry_key(worker_id: &str) -> String {
    format!("bifrost:pool:{worker_id}")
}

/// In-memory registry for tests and single-process deployments. TTL is
/// recorded but not actively swept — nothing reads a registration after
/// its pool has stopped, so an unenforced TTL is harmless here.
pub struct InMemoryPoolRegistry {
    entries: DashMap<String, HashMap<String, String>>,
}

impl InMemoryPoolRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn snapshot(&self, worker_id: &str) -> Option<HashMap<String, String>> {
        self.entries.get(worker_id).map(|e| e.clone())
    }
}

impl Default for InMemoryPoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PoolRegistry for InMemoryPoolRegistry {
    async fn register(&self, worker_id: &str, fields: HashMap<String, String>, _ttl: Duration) {
        self.entries.insert(worker_id.to_string(), fields);
    }

    async fn refresh_ttl(&self, _worker_id: &str, _ttl: Duration) {}

    async fn update_fields(&self, worker_id: &str, fields: HashMap<String, String>) {
        self.entries.entry(worker_id.to_string()).or_default().extend(fields);
    }

    async fn unregister(&self, worker_id: &str) {
        self.entries.remove(worker_id);
    }
}

/// `fred`-backed registry, matching `RedisContextStore`'s client-wrapping
/// idiom: a Redis hash per pool, `EXPIRE`d to the registration TTL and
/// refreshed by the heartbeat loop.
pub struct RedisPoolRegistry {
    client: fred::clients::RedisClient,
}

impl RedisPoolRegistry {
    pub fn new(client: fred::clients::RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PoolRegistry for RedisPoolRegistry {
    async fn register(&self, worker_id: &str, fields: HashMap<String, String>, ttl: Duration) {
        let key = registry_key(worker_id);
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        if let Err(err) = self.client.hset::<(), _, _>(&key, pairs).await {
            tracing::warn!(worker_id, error = %err, "failed to register pool in redis");
            return;
        }
        if let Err(err) = self.client.expire::<(), _>(&key, ttl.as_secs() as i64, None).await {
            tracing::warn!(worker_id, error = %err, "failed to set pool registration ttl");
        }
    }

    async fn refresh_ttl(&self, worker_id: &str, ttl: Duration) {
        let key = registry_key(worker_id);
        if let Err(err) = self.client.expire::<(), _>(&key, ttl.as_secs() as i64, None).await {
            tracing::warn!(worker_id, error = %err, "failed to refresh pool registration ttl");
        }
    }

    async fn update_fields(&self, worker_id: &str, fields: HashMap<String, String>) {
        let key = registry_key(worker_id);
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        if let Err(err) = self.client.hset::<(), _, _>(&key, pairs).await {
            tracing::warn!(worker_id, error = %err, "failed to update pool registration fields");
        }
    }

    async fn unregister(&self, worker_id: &str) {
        let key = registry_key(worker_id);
        if let Err(err) = self.client.del::<(), _>(&key).await {
            tracing::warn!(worker_id, error = %err, "failed to unregister pool");
        }
    }
}
