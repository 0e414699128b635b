use async_trait::async_trait;
use bifrost_common::model::ExecutionContext;
use fred::prelude::*;
use std::time::Duration;

use crate::{context_key, ContextStore, ContextStoreError};

/// `fred`-backed `ContextStore`. Native TTL via `SET key value EX ttl`;
/// expiry is enforced by Redis, not polled.
pub struct RedisContextStore {
    client: RedisClient,
}

impl RedisContextStore {
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ContextStore for RedisContextStore {
    async fn set(
        &self,
        execution_id: &str,
        ctx: ExecutionContext,
        ttl: Duration,
    ) -> Result<(), ContextStoreError> {
        let payload = serde_json::to_string(&ctx)?;
        self.client
            .set::<(), _, _>(
                context_key(execution_id),
                payload,
                Some(Expiration::EX(ttl.as_secs() as i64)),
                None,
                false,
            )
            .await
            .map_err(|e| ContextStoreError::Redis(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, ContextStoreError> {
        let payload: Option<String> = self
            .client
            .get(context_key(execution_id))
            .await
            .map_err(|e| ContextStoreError::Redis(e.to_string()))?;
        let payload = payload.ok_or_else(|| ContextStoreError::NotFound(execution_id.to_string()))?;
        Ok(serde_json::from_str(&payload)?)
    }
}
