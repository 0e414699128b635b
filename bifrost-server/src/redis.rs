use bifrost_common::config::RedisConfig;
use fred::clients::RedisClient;
use fred::error::RedisError;
use fred::interfaces::ClientLike;
use fred::types::{ConnectionConfig, ReconnectPolicy, ServerConfig};

/// Connects a shared `fred` client against one logical Redis instance,
/// used to back `RedisBus`, `RedisContextStore`, and `RedisPoolRegistry`
/// alike (they each wrap their own clone of the same connected client).
pub async fn connect(config: &RedisConfig) -> Result<RedisClient, RedisError> {
    let mut redis_config = fred::types::RedisConfig::default();
    redis_config.server = ServerConfig::new_centralized(&config.host, config.port);
    redis_config.database = Some(config.database);
    redis_config.username = config.username.clone();
    redis_config.password = config.password.clone();

    let client = RedisClient::new(
        redis_config,
        None,
        Some(ConnectionConfig::default()),
        Some(ReconnectPolicy::new_exponential(0, 100, 30_000, 2)),
    );
    let _ = client.connect();
    client.wait_for_connect().await?;
    Ok(client)
}
