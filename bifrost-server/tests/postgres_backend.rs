use bifrost_common::config::DbPostgresConfig;
use bifrost_common::model::{Entity, EntityKind, ExecutionMode};
use bifrost_indexing::entities::{EntityRepo, SqlEntityRepo};
use bifrost_server::db::{create_postgres_pool, migrate_postgres};
use bifrost_storage::{SqlTextIndex, TextIndex};
use chrono::Utc;
use std::sync::Arc;
use testcontainers::runners::AsyncRunner;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

fn sample_entity(path: &str, function_symbol: &str) -> Entity {
    Entity {
        id: Uuid::nil(),
        name: "Greet".to_string(),
        function_symbol: function_symbol.to_string(),
        path: path.to_string(),
        kind: EntityKind::Workflow,
        description: None,
        category: "General".to_string(),
        tags: Vec::new(),
        parameters_schema: Vec::new(),
        endpoint_enabled: false,
        allowed_methods: vec!["POST".to_string()],
        execution_mode: ExecutionMode::Sync,
        timeout_seconds: 1800,
        cache_ttl_seconds: 300,
        is_active: true,
        is_orphaned: false,
        last_seen_at: Utc::now(),
    }
}

#[tokio::test]
async fn entity_upsert_is_idempotent_on_identity_key() {
    let container = Postgres::default().start().await.expect("start postgres container");
    let port = container.get_host_port_ipv4(5432).await.expect("mapped port");

    let config = DbPostgresConfig {
        host: "127.0.0.1".to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        max_connections: 5,
        schema: "public".to_string(),
    };

    let pool = create_postgres_pool(&config).await.expect("connect to postgres");
    migrate_postgres(&pool).await.expect("run migrations");
    let pool = Arc::new(pool);

    let repo = SqlEntityRepo::new(pool.clone());

    let first = repo
        .upsert(sample_entity("workflows/greet.py", "greet"))
        .await
        .expect("first upsert");
    assert_ne!(first.id, Uuid::nil());

    let mut second_write = sample_entity("workflows/greet.py", "greet");
    second_write.description = Some("updated".to_string());
    let second = repo.upsert(second_write).await.expect("second upsert");

    assert_eq!(first.id, second.id, "upsert on the same (path, function_symbol) must keep the id stable");
    assert_eq!(second.description.as_deref(), Some("updated"));

    let fetched = repo
        .find_by_path_and_symbol("workflows/greet.py", "greet")
        .await
        .expect("lookup")
        .expect("entity present");
    assert_eq!(fetched.id, first.id);

    let renamed_id = Uuid::new_v4();
    repo.rename_function_symbol(first.id, "greet_v2")
        .await
        .unwrap_or_else(|err| panic!("rename should succeed for an existing id: {err}"));
    let _ = renamed_id;

    let by_old_symbol = repo.find_by_path_and_symbol("workflows/greet.py", "greet").await.expect("lookup");
    assert!(by_old_symbol.is_none(), "the old function_symbol must no longer resolve after rename");

    let by_new_symbol = repo
        .find_by_path_and_symbol("workflows/greet.py", "greet_v2")
        .await
        .expect("lookup")
        .expect("entity present under its new symbol");
    assert_eq!(by_new_symbol.id, first.id);
}

#[tokio::test]
async fn text_index_upsert_overwrites_content_and_hash() {
    let container = Postgres::default().start().await.expect("start postgres container");
    let port = container.get_host_port_ipv4(5432).await.expect("mapped port");

    let config = DbPostgresConfig {
        host: "127.0.0.1".to_string(),
        port,
        database: "postgres".to_string(),
        username: "postgres".to_string(),
        password: "postgres".to_string(),
        max_connections: 5,
        schema: "public".to_string(),
    };

    let pool = create_postgres_pool(&config).await.expect("connect to postgres");
    migrate_postgres(&pool).await.expect("run migrations");
    let pool = Arc::new(pool);

    let index = SqlTextIndex::new(pool);

    index
        .upsert("workflows/greet.py", "def greet(): ...", "hash-v1", Utc::now())
        .await
        .expect("initial upsert");

    let first = index.get("workflows/greet.py").await.expect("get").expect("present");
    assert_eq!(first.content_hash, "hash-v1");

    index
        .upsert("workflows/greet.py", "def greet(name): ...", "hash-v2", Utc::now())
        .await
        .expect("overwrite upsert");

    let second = index.get("workflows/greet.py").await.expect("get").expect("present");
    assert_eq!(second.content_hash, "hash-v2");
    assert_eq!(second.content, "def greet(name): ...");
}
