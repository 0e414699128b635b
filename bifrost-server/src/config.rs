use std::path::PathBuf;

use bifrost_common::config::{ConfigExample, ConfigLoader, DbConfig, HasConfigExamples, PoolConfig, RedisConfig};
use bifrost_common::tracing_setup::TracingConfig;
use serde::{Deserialize, Serialize};

/// Top-level config for the bifrost-server binary: one struct composing
/// every component crate's own config primitive, loaded through a single
/// `ConfigLoader` (default -> `config/bifrost-server.toml` -> `BIFROST_`
/// env overrides).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BifrostServerConfig {
    pub tracing: TracingConfig,
    pub environment: String,
    pub http_port: u16,
    pub grpc_port: u16,
    pub db: DbConfig,
    pub redis: RedisConfig,
    pub blob_storage: BlobBackendConfig,
    pub pool: PoolConfig,
    pub cors_origin_regex: String,
    pub context_ttl_seconds: u64,
}

/// Where blobs live. `InMemory` is the zero-dependency default for local
/// development and tests; `S3` is the production backend
/// (`bifrost-storage::S3BlobStore`).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlobBackendConfig {
    InMemory,
    S3(bifrost_common::config::BlobStorageConfig),
}

impl Default for BlobBackendConfig {
    fn default() -> Self {
        BlobBackendConfig::InMemory
    }
}

impl Default for BifrostServerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("bifrost-server"),
            environment: "dev".to_string(),
            http_port: 8080,
            grpc_port: 9090,
            db: DbConfig::default(),
            redis: RedisConfig::default(),
            blob_storage: BlobBackendConfig::default(),
            pool: PoolConfig::default(),
            cors_origin_regex: "https://*".to_string(),
            context_ttl_seconds: 3600,
        }
    }
}

impl HasConfigExamples<BifrostServerConfig> for BifrostServerConfig {
    fn examples() -> Vec<ConfigExample<BifrostServerConfig>> {
        vec![ConfigExample {
            name: "default",
            config: BifrostServerConfig::default(),
        }]
    }
}

pub fn make_config_loader() -> ConfigLoader<BifrostServerConfig> {
    ConfigLoader::new_with_examples(&PathBuf::from("config/bifrost-server.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_is_loadable() {
        make_config_loader().load().expect("failed to load config");
    }
}
