use std::sync::Arc;

use async_trait::async_trait;
use bifrost_bus::PubSubBus;
use bifrost_bus::{InMemoryBus, RedisBus};
use bifrost_common::config::DbConfig;
use bifrost_context::{ContextStore, InMemoryContextStore, RedisContextStore};
use bifrost_indexing::{
    AgentRepo, EntityRepo, FormRepo, InMemoryAgentRepo, InMemoryEntityRepo, InMemoryFormRepo, SqlAgentRepo,
    SqlEntityRepo, SqlFormRepo, WritePipeline,
};
use bifrost_indexing::NoExecutionHistory;
use bifrost_pool::{
    InMemoryPoolRegistry, InProcessSpawner, PoolRegistry, ProcessPoolConfig, ProcessPoolManager, RedisPoolRegistry,
    ResultSink, WorkflowLookup,
};
use bifrost_pool::runtime::MockRuntime;
use bifrost_reindex::Reindexer;
use bifrost_storage::{BlobStore, InMemoryBlobStore, InMemoryModuleCache, S3BlobStore, SqlTextIndex, TextIndex};

use crate::config::{BifrostServerConfig, BlobBackendConfig};
use crate::result_bus::BusResultSink;
use crate::workflow_lookup::EntityRepoLookup;
use crate::{db, redis};

/// Every component crate's public surface, wired once at startup and
/// shared (behind `Arc`) across the HTTP API, gRPC health service, and the
/// process pool manager's own background tasks.
#[derive(Clone)]
pub struct Services {
    pub blobs: Arc<dyn BlobStore + Send + Sync>,
    pub text_index: Arc<dyn TextIndex + Send + Sync>,
    pub module_cache: Arc<InMemoryModuleCache>,
    pub entities: Arc<dyn EntityRepo + Send + Sync>,
    pub forms: Arc<dyn FormRepo + Send + Sync>,
    pub agents: Arc<dyn AgentRepo + Send + Sync>,
    pub context_store: Arc<dyn ContextStore + Send + Sync>,
    pub bus: Arc<dyn PubSubBus + Send + Sync>,
    pub registry: Arc<dyn PoolRegistry + Send + Sync>,
    pub write_pipeline: Arc<WritePipelineHandle>,
    pub reindexer: Arc<ReindexerHandle>,
    pub pool: Arc<ProcessPoolManager<dyn ContextStore + Send + Sync>>,
    pub context_ttl_seconds: u64,
    pub default_timeout_seconds: u64,
    pub graceful_shutdown_seconds: u64,
}

/// `WritePipeline` is generic over seven backing stores; naming the full
/// instantiation once here keeps every call site in `api/` from having to
/// spell it out.
pub type WritePipelineHandle = WritePipeline<
    dyn BlobStore + Send + Sync,
    dyn TextIndex + Send + Sync,
    InMemoryModuleCache,
    dyn EntityRepo + Send + Sync,
    dyn FormRepo + Send + Sync,
    dyn AgentRepo + Send + Sync,
    NoExecutionHistory,
>;

pub type ReindexerHandle = Reindexer<
    dyn BlobStore + Send + Sync,
    dyn TextIndex + Send + Sync,
    dyn EntityRepo + Send + Sync,
    dyn FormRepo + Send + Sync,
    dyn AgentRepo + Send + Sync,
>;

impl Services {
    pub async fn new(config: &BifrostServerConfig) -> Result<Services, anyhow::Error> {
        let (entities, forms, agents, text_index): (
            Arc<dyn EntityRepo + Send + Sync>,
            Arc<dyn FormRepo + Send + Sync>,
            Arc<dyn AgentRepo + Send + Sync>,
            Arc<dyn TextIndex + Send + Sync>,
        ) = match config.db.clone() {
            DbConfig::Postgres(c) => {
                let pool = Arc::new(db::create_postgres_pool(&c).await?);
                db::migrate_postgres(&pool).await?;
                (
                    Arc::new(SqlEntityRepo::new(pool.clone())),
                    Arc::new(SqlFormRepo::new(pool.clone())),
                    Arc::new(SqlAgentRepo::new(pool.clone())),
                    Arc::new(SqlTextIndex::new(pool)),
                )
            }
            DbConfig::Sqlite(c) => {
                let pool = Arc::new(db::create_sqlite_pool(&c).await?);
                db::migrate_sqlite(&pool).await?;
                (
                    Arc::new(SqlEntityRepo::new(pool.clone())),
                    Arc::new(SqlFormRepo::new(pool.clone())),
                    Arc::new(SqlAgentRepo::new(pool.clone())),
                    Arc::new(SqlTextIndex::new(pool)),
                )
            }
        };

        let blobs: Arc<dyn BlobStore + Send + Sync> = match &config.blob_storage {
            BlobBackendConfig::InMemory => Arc::new(InMemoryBlobStore::new()),
            BlobBackendConfig::S3(c) => {
                let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest()).load().await;
                let s3_config = match &c.endpoint_url {
                    Some(endpoint) => aws_sdk_s3::config::Builder::from(&aws_config)
                        .endpoint_url(endpoint)
                        .force_path_style(true)
                        .build(),
                    None => aws_sdk_s3::config::Builder::from(&aws_config).build(),
                };
                let client = aws_sdk_s3::Client::from_conf(s3_config);
                Arc::new(S3BlobStore::new(client, c.bucket.clone()))
            }
        };

        let module_cache = Arc::new(InMemoryModuleCache::new());

        let (context_store, bus, registry): (
            Arc<dyn ContextStore + Send + Sync>,
            Arc<dyn PubSubBus + Send + Sync>,
            Arc<dyn PoolRegistry + Send + Sync>,
        ) = if matches!(config.db, DbConfig::Sqlite(_)) && !redis_configured(config) {
            (
                Arc::new(InMemoryContextStore::new()),
                Arc::new(InMemoryBus::new()),
                Arc::new(InMemoryPoolRegistry::new()),
            )
        } else {
            let client = redis::connect(&config.redis).await?;
            (
                Arc::new(RedisContextStore::new(client.clone())),
                Arc::new(RedisBus::new(client.clone())),
                Arc::new(RedisPoolRegistry::new(client)),
            )
        };

        let history = Arc::new(NoExecutionHistory);
        let write_pipeline = Arc::new(WritePipeline::new(
            blobs.clone(),
            text_index.clone(),
            module_cache.clone(),
            entities.clone(),
            forms.clone(),
            agents.clone(),
            history,
        ));

        let reindexer = Arc::new(Reindexer::new(
            blobs.clone(),
            text_index.clone(),
            entities.clone(),
            forms.clone(),
            agents.clone(),
        ));

        let lookup: Arc<dyn WorkflowLookup> = Arc::new(EntityRepoLookup::new(entities.clone()));
        let runtime = Arc::new(MockRuntime::new());
        let spawner = Arc::new(InProcessSpawner::new(
            context_store.clone(),
            lookup,
            blobs.clone(),
            text_index.clone(),
            module_cache.clone(),
            runtime,
        ));

        let result_sink: Arc<dyn ResultSink> = Arc::new(BusResultSink::new(bus.clone()));

        let pool_config = ProcessPoolConfig {
            worker_id: worker_id(),
            min_workers: config.pool.min_workers,
            max_workers: config.pool.max_workers,
            graceful_shutdown: std::time::Duration::from_secs(config.pool.graceful_shutdown_seconds),
            recycle_after_executions: config.pool.recycle_after_executions,
            heartbeat_interval: std::time::Duration::from_secs(config.pool.heartbeat_interval_seconds),
            registration_ttl: std::time::Duration::from_secs(config.pool.heartbeat_interval_seconds * 3),
        };

        let pool = Arc::new(ProcessPoolManager::new(
            pool_config,
            spawner,
            context_store.clone(),
            bus.clone(),
            registry.clone(),
            result_sink,
        ));

        Ok(Services {
            blobs,
            text_index,
            module_cache,
            entities,
            forms,
            agents,
            context_store,
            bus,
            registry,
            write_pipeline,
            reindexer,
            pool,
            context_ttl_seconds: config.context_ttl_seconds,
            default_timeout_seconds: config.pool.default_timeout_seconds,
            graceful_shutdown_seconds: config.pool.graceful_shutdown_seconds,
        })
    }
}

fn redis_configured(config: &BifrostServerConfig) -> bool {
    std::env::var("BIFROST_REDIS__HOST").is_ok() || config.redis.host != "localhost"
}

fn worker_id() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}
