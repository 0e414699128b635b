use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A named example configuration, rendered into the generated `*.toml`
/// example file shipped alongside a service binary.
pub struct ConfigExample<T> {
    pub name: &'static str,
    pub config: T,
}

/// Implemented by every top-level service config so `ConfigLoader` can
/// emit `config/<service>.toml` example files during development.
pub trait HasConfigExamples<T> {
    fn examples() -> Vec<ConfigExample<T>>;
}

/// Loads a config of type `T` by layering, in increasing priority: the
/// struct's `Default`, a TOML file at `path` (optional), and `BIFROST_`
/// prefixed environment variables with `__` as the nesting separator.
pub struct ConfigLoader<T> {
    path: PathBuf,
    _marker: std::marker::PhantomData<T>,
}

impl<T> ConfigLoader<T>
where
    T: Default + Serialize + DeserializeOwned,
{
    pub fn new_with_examples(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            _marker: std::marker::PhantomData,
        }
    }

    pub fn load(&self) -> Result<T, figment::Error> {
        let default = T::default();
        let mut figment = Figment::from(figment::providers::Serialized::defaults(default));
        if self.path.exists() {
            figment = figment.merge(Toml::file(&self.path));
        }
        figment = figment.merge(Env::prefixed("BIFROST_").split("__"));
        figment.extract()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DbConfig {
    Postgres(DbPostgresConfig),
    Sqlite(DbSqliteConfig),
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::Sqlite(DbSqliteConfig::default())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbPostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub max_connections: u32,
    pub schema: String,
}

impl Default for DbPostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            database: "bifrost".to_string(),
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            max_connections: 10,
            schema: "public".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbSqliteConfig {
    pub database: String,
    pub max_connections: u32,
}

impl Default for DbSqliteConfig {
    fn default() -> Self {
        Self {
            database: "bifrost.db".to_string(),
            max_connections: 10,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub key_prefix: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub pool_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 6379,
            database: 0,
            key_prefix: "bifrost".to_string(),
            username: None,
            password: None,
            pool_size: 8,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BlobStorageConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint_url: Option<String>,
}

impl Default for BlobStorageConfig {
    fn default() -> Self {
        Self {
            bucket: "bifrost-artifacts".to_string(),
            region: "us-east-1".to_string(),
            endpoint_url: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub heartbeat_interval_seconds: u64,
    pub graceful_shutdown_seconds: u64,
    pub recycle_after_executions: u64,
    pub default_timeout_seconds: u64,
    pub idle_wait_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            heartbeat_interval_seconds: 10,
            graceful_shutdown_seconds: 5,
            recycle_after_executions: 500,
            default_timeout_seconds: 1800,
            idle_wait_timeout_ms: 2000,
        }
    }
}
