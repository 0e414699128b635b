pub mod memory;
pub mod redis;

pub use memory::InMemoryContextStore;
pub use redis::RedisContextStore;

use async_trait::async_trait;
use bifrost_common::model::ExecutionContext;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContextStoreError {
    #[error("execution context expired or never set: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(String),
}

/// Key layout shared by both backends: `exec:<execution_id>:context`.
pub fn context_key(execution_id: &str) -> String {
    format!("exec:{execution_id}:context")
}

/// Short-TTL KV store for `ExecutionContext` (C8). `set` followed by `get`
/// from a different worker must succeed within a small window — readers
/// tolerate eventual consistency, not strict read-your-writes.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn set(
        &self,
        execution_id: &str,
        ctx: ExecutionContext,
        ttl: Duration,
    ) -> Result<(), ContextStoreError>;

    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, ContextStoreError>;
}

#[cfg(test)]
test_r::enable!();
