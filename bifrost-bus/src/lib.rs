pub mod in_memory;
pub mod redis;

pub use in_memory::InMemoryBus;
pub use redis::RedisBus;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(String),
}

/// Well-known channel names used by the core. Payloads are JSON objects
/// with a `type` discriminator; no schema is enforced by the bus itself.
pub mod channels {
    pub const WORKER_HEARTBEAT: &str = "worker:heartbeat";
    pub const WORKER_SCALING: &str = "worker:scaling";
    pub const WORKER_PROGRESS: &str = "worker:progress";
    pub const WORKER_CONFIG_CHANGED: &str = "worker:config_changed";
    pub const CANCEL: &str = "cancel";

    /// The pool-scoped command channel a given pool listens on, named by
    /// `worker_id` (the pool as a whole, not an individual worker, owns this
    /// channel — `worker_id` here is the pool's identity).
    pub fn pool_commands(worker_id: &str) -> String {
        format!("pool:{worker_id}:commands")
    }
}

/// Broadcast pub/sub with no queueing: a subscriber that isn't listening
/// when a message is published never sees it. Implemented over
/// `tokio::sync::broadcast` for single-node/test use and over `fred`'s
/// Redis pub/sub for production multi-node deployments.
#[async_trait]
pub trait PubSubBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: Value) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<BusSubscription, BusError>;
}

/// A live subscription to one channel. Lagged broadcast receivers (the
/// subscriber fell behind and the channel's ring buffer overwrote
/// messages it hadn't read yet) are swallowed transparently rather than
/// surfaced as an error callers need to handle.
pub enum BusSubscription {
    Broadcast(tokio::sync::broadcast::Receiver<Value>),
    Redis {
        receiver: tokio::sync::broadcast::Receiver<fred::prelude::Message>,
        channel: String,
    },
}

impl BusSubscription {
    pub async fn recv(&mut self) -> Option<Value> {
        match self {
            BusSubscription::Broadcast(receiver) => loop {
                match receiver.recv().await {
                    Ok(value) => return Some(value),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            },
            BusSubscription::Redis { receiver, channel } => loop {
                match receiver.recv().await {
                    Ok(message) => {
                        if message.channel.as_str() != channel {
                            continue;
                        }
                        let Some(text) = message.value.as_string() else { continue };
                        match serde_json::from_str(&text) {
                            Ok(value) => return Some(value),
                            Err(err) => {
                                tracing::warn!(channel, error = %err, "dropping malformed bus payload");
                                continue;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
                }
            },
        }
    }
}

#[cfg(test)]
test_r::enable!();
