use async_trait::async_trait;
use bifrost_common::model::ExecutionContext;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::{context_key, ContextStore, ContextStoreError};

struct Entry {
    ctx: ExecutionContext,
    expires_at: DateTime<Utc>,
}

/// `dashmap`-backed `ContextStore` for tests and single-process deployments.
/// A background sweep task evicts expired entries on an interval rather
/// than on every read, matching the KV store's native-TTL semantics
/// without pulling in a timer wheel per entry.
pub struct InMemoryContextStore {
    entries: Arc<DashMap<String, Entry>>,
    _sweeper: tokio::task::JoinHandle<()>,
}

impl InMemoryContextStore {
    pub fn new() -> Self {
        Self::with_sweep_interval(Duration::from_secs(30))
    }

    pub fn with_sweep_interval(interval: Duration) -> Self {
        let entries: Arc<DashMap<String, Entry>> = Arc::new(DashMap::new());
        let sweep_entries = entries.clone();
        let sweeper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let before = sweep_entries.len();
                sweep_entries.retain(|_, entry| entry.expires_at > now);
                let evicted = before - sweep_entries.len();
                if evicted > 0 {
                    debug!(evicted, "swept expired execution contexts");
                }
            }
        });
        Self {
            entries,
            _sweeper: sweeper,
        }
    }
}

impl Default for InMemoryContextStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InMemoryContextStore {
    fn drop(&mut self) {
        self._sweeper.abort();
    }
}

#[async_trait]
impl ContextStore for InMemoryContextStore {
    async fn set(
        &self,
        execution_id: &str,
        ctx: ExecutionContext,
        ttl: Duration,
    ) -> Result<(), ContextStoreError> {
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(3600));
        self.entries
            .insert(context_key(execution_id), Entry { ctx, expires_at });
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<ExecutionContext, ContextStoreError> {
        let key = context_key(execution_id);
        match self.entries.get(&key) {
            Some(entry) if entry.expires_at > Utc::now() => Ok(entry.ctx.clone()),
            _ => Err(ContextStoreError::NotFound(execution_id.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_ctx(execution_id: &str) -> ExecutionContext {
        ExecutionContext {
            execution_id: execution_id.to_string(),
            user_id: "user-1".to_string(),
            org_id: "org-1".to_string(),
            workflow_name: "greet".to_string(),
            parameters: serde_json::json!({"name": "Ada"}),
            timeout_seconds: 1800,
            deadline: Utc::now() + chrono::Duration::seconds(1800),
        }
    }

    #[test_r::test(tokio::test)]
    async fn set_then_get_round_trips() {
        let store = InMemoryContextStore::new();
        store
            .set("exec-1", sample_ctx("exec-1"), Duration::from_secs(60))
            .await
            .unwrap();
        let ctx = store.get("exec-1").await.unwrap();
        assert_eq!(ctx.user_id, "user-1");
    }

    #[test_r::test(tokio::test)]
    async fn expired_entry_is_not_found() {
        let store = InMemoryContextStore::new();
        store
            .set("exec-1", sample_ctx("exec-1"), Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = store.get("exec-1").await;
        assert!(matches!(result, Err(ContextStoreError::NotFound(_))));
    }

    #[test_r::test(tokio::test)]
    async fn missing_execution_is_not_found() {
        let store = InMemoryContextStore::new();
        let result = store.get("never-set").await;
        assert!(matches!(result, Err(ContextStoreError::NotFound(_))));
    }
}
