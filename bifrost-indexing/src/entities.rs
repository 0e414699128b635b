use async_trait::async_trait;
use bifrost_common::model::{Entity, EntityKind, ExecutionMode};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{Database, Pool};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::RwLock;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("entity not found: {0}")]
    NotFound(Uuid),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Entity table operations needed by the indexer, the deactivation guard,
/// and the reindexer. `upsert` preserves `id` on conflict; the identity key
/// is `(path, function_symbol)` but the conflict target differs by kind:
/// workflow/tool upsert on `id`, data_provider upserts on
/// `(path, function_symbol)` directly.
#[async_trait]
pub trait EntityRepo: Send + Sync {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, RepoError>;

    async fn find_by_path_and_symbol(
        &self,
        path: &str,
        function_symbol: &str,
    ) -> Result<Option<Entity>, RepoError>;

    async fn list_active_by_path(&self, path: &str) -> Result<Vec<Entity>, RepoError>;

    async fn find_active_by_name(&self, name: &str) -> Result<Vec<Entity>, RepoError>;

    /// Insert or update, preserving `id` when the identity key already
    /// exists. Returns the stored entity (with `id` filled in).
    async fn upsert(&self, entity: Entity) -> Result<Entity, RepoError>;

    /// Rewrites `function_symbol` in place, preserving `id` and every other
    /// field — the rename-with-identity path.
    async fn rename_function_symbol(&self, id: Uuid, new_symbol: &str) -> Result<(), RepoError>;

    /// Soft-deletes every active entity at `path`:
    /// `is_active=false, is_orphaned=true`.
    async fn deactivate_all_for_path(&self, path: &str) -> Result<u64, RepoError>;

    /// Deactivates exactly the entities whose symbols disappeared, used by
    /// a confirmed `force_deactivation` write.
    async fn deactivate_missing_symbols(
        &self,
        path: &str,
        remaining_symbols: &[String],
    ) -> Result<u64, RepoError>;
}

/// In-memory `EntityRepo`, used by unit tests and the pipeline's own test
/// suite.
#[derive(Default)]
pub struct InMemoryEntityRepo {
    by_id: DashMap<Uuid, Entity>,
    // Guards compound insert-or-update so two upserts racing on the same
    // identity key can't both decide "not found" and create two rows.
    write_lock: RwLock<()>,
}

impl InMemoryEntityRepo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityRepo for InMemoryEntityRepo {
    async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, RepoError> {
        Ok(self.by_id.get(&id).map(|e| e.clone()))
    }

    async fn find_by_path_and_symbol(
        &self,
        path: &str,
        function_symbol: &str,
    ) -> Result<Option<Entity>, RepoError> {
        Ok(self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .find(|e| e.path == path && e.function_symbol == function_symbol))
    }

    async fn list_active_by_path(&self, path: &str) -> Result<Vec<Entity>, RepoError> {
        Ok(self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|e| e.path == path && e.is_active)
            .collect())
    }

    async fn find_active_by_name(&self, name: &str) -> Result<Vec<Entity>, RepoError> {
        Ok(self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|e| e.name == name && e.is_active)
            .collect())
    }

    async fn upsert(&self, mut entity: Entity) -> Result<Entity, RepoError> {
        let _guard = self.write_lock.write().unwrap();
        let existing = self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .find(|e| e.path == entity.path && e.function_symbol == entity.function_symbol);

        if let Some(existing) = existing {
            entity.id = existing.id;
        }
        entity.last_seen_at = Utc::now();
        self.by_id.insert(entity.id, entity.clone());
        Ok(entity)
    }

    async fn rename_function_symbol(&self, id: Uuid, new_symbol: &str) -> Result<(), RepoError> {
        let _guard = self.write_lock.write().unwrap();
        let mut entry = self.by_id.get_mut(&id).ok_or(RepoError::NotFound(id))?;
        entry.function_symbol = new_symbol.to_string();
        Ok(())
    }

    async fn deactivate_all_for_path(&self, path: &str) -> Result<u64, RepoError> {
        let mut count = 0;
        for mut entry in self.by_id.iter_mut() {
            if entry.path == path && entry.is_active {
                entry.is_active = false;
                entry.is_orphaned = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn deactivate_missing_symbols(
        &self,
        path: &str,
        remaining_symbols: &[String],
    ) -> Result<u64, RepoError> {
        let mut count = 0;
        for mut entry in self.by_id.iter_mut() {
            if entry.path == path
                && entry.is_active
                && !remaining_symbols.contains(&entry.function_symbol)
            {
                entry.is_active = false;
                count += 1;
            }
        }
        Ok(count)
    }
}

/// `sqlx`-backed `EntityRepo`. The upsert conflict target differs by kind:
/// workflow/tool resolve their existing `id` via a `(path, function_symbol)`
/// lookup first and upsert on `id`, while `data_provider` rows carry a
/// unique constraint directly on `(path, function_symbol)` and upsert on
/// that pair in one round trip.
pub struct SqlEntityRepo<DB: Database> {
    pool: Arc<Pool<DB>>,
}

impl<DB: Database> SqlEntityRepo<DB> {
    pub fn new(pool: Arc<Pool<DB>>) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EntityRow {
    id: Uuid,
    name: String,
    function_symbol: String,
    path: String,
    kind: String,
    description: Option<String>,
    category: String,
    tags: serde_json::Value,
    parameters_schema: serde_json::Value,
    endpoint_enabled: bool,
    allowed_methods: serde_json::Value,
    execution_mode: String,
    timeout_seconds: i64,
    cache_ttl_seconds: i64,
    is_active: bool,
    is_orphaned: bool,
    last_seen_at: DateTime<Utc>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = RepoError;

    fn try_from(row: EntityRow) -> Result<Self, Self::Error> {
        let kind = match row.kind.as_str() {
            "tool" => EntityKind::Tool,
            "data_provider" => EntityKind::DataProvider,
            _ => EntityKind::Workflow,
        };
        let execution_mode = match row.execution_mode.as_str() {
            "async" => ExecutionMode::Async,
            _ => ExecutionMode::Sync,
        };
        Ok(Entity {
            id: row.id,
            name: row.name,
            function_symbol: row.function_symbol,
            path: row.path,
            kind,
            description: row.description,
            category: row.category,
            tags: serde_json::from_value(row.tags).unwrap_or_default(),
            parameters_schema: serde_json::from_value(row.parameters_schema).unwrap_or_default(),
            endpoint_enabled: row.endpoint_enabled,
            allowed_methods: serde_json::from_value(row.allowed_methods).unwrap_or_default(),
            execution_mode,
            timeout_seconds: row.timeout_seconds,
            cache_ttl_seconds: row.cache_ttl_seconds,
            is_active: row.is_active,
            is_orphaned: row.is_orphaned,
            last_seen_at: row.last_seen_at,
        })
    }
}

fn kind_label(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Workflow => "workflow",
        EntityKind::Tool => "tool",
        EntityKind::DataProvider => "data_provider",
    }
}

fn execution_mode_label(mode: ExecutionMode) -> &'static str {
    match mode {
        ExecutionMode::Sync => "sync",
        ExecutionMode::Async => "async",
    }
}

macro_rules! impl_sql_entity_repo {
    ($backend:ty, $upsert_by_id:literal, $upsert_by_path_symbol:literal) => {
        #[async_trait]
        impl EntityRepo for SqlEntityRepo<$backend> {
            async fn find_by_id(&self, id: Uuid) -> Result<Option<Entity>, RepoError> {
                let row = sqlx::query_as::<_, EntityRow>("SELECT * FROM entities WHERE id = $1")
                    .bind(id)
                    .fetch_optional(self.pool.deref())
                    .await?;
                row.map(Entity::try_from).transpose()
            }

            async fn find_by_path_and_symbol(
                &self,
                path: &str,
                function_symbol: &str,
            ) -> Result<Option<Entity>, RepoError> {
                let row = sqlx::query_as::<_, EntityRow>(
                    "SELECT * FROM entities WHERE path = $1 AND function_symbol = $2",
                )
                .bind(path)
                .bind(function_symbol)
                .fetch_optional(self.pool.deref())
                .await?;
                row.map(Entity::try_from).transpose()
            }

            async fn list_active_by_path(&self, path: &str) -> Result<Vec<Entity>, RepoError> {
                let rows = sqlx::query_as::<_, EntityRow>(
                    "SELECT * FROM entities WHERE path = $1 AND is_active = true",
                )
                .bind(path)
                .fetch_all(self.pool.deref())
                .await?;
                rows.into_iter().map(Entity::try_from).collect()
            }

            async fn find_active_by_name(&self, name: &str) -> Result<Vec<Entity>, RepoError> {
                let rows = sqlx::query_as::<_, EntityRow>(
                    "SELECT * FROM entities WHERE name = $1 AND is_active = true",
                )
                .bind(name)
                .fetch_all(self.pool.deref())
                .await?;
                rows.into_iter().map(Entity::try_from).collect()
            }

            async fn upsert(&self, mut entity: Entity) -> Result<Entity, RepoError> {
                let query = match entity.kind {
                    EntityKind::DataProvider => {
                        sqlx::query_as::<_, EntityRow>($upsert_by_path_symbol)
                    }
                    EntityKind::Workflow | EntityKind::Tool => {
                        if let Some(existing) = self
                            .find_by_path_and_symbol(&entity.path, &entity.function_symbol)
                            .await?
                        {
                            entity.id = existing.id;
                        }
                        sqlx::query_as::<_, EntityRow>($upsert_by_id)
                    }
                };
                let row = query
                    .bind(entity.id)
                    .bind(&entity.name)
                    .bind(&entity.function_symbol)
                    .bind(&entity.path)
                    .bind(kind_label(entity.kind))
                    .bind(&entity.description)
                    .bind(&entity.category)
                    .bind(serde_json::to_value(&entity.tags).unwrap_or_default())
                    .bind(serde_json::to_value(&entity.parameters_schema).unwrap_or_default())
                    .bind(entity.endpoint_enabled)
                    .bind(serde_json::to_value(&entity.allowed_methods).unwrap_or_default())
                    .bind(execution_mode_label(entity.execution_mode))
                    .bind(entity.timeout_seconds)
                    .bind(entity.cache_ttl_seconds)
                    .bind(entity.is_active)
                    .bind(entity.is_orphaned)
                    .bind(Utc::now())
                    .fetch_one(self.pool.deref())
                    .await?;
                Entity::try_from(row)
            }

            async fn rename_function_symbol(
                &self,
                id: Uuid,
                new_symbol: &str,
            ) -> Result<(), RepoError> {
                sqlx::query("UPDATE entities SET function_symbol = $1 WHERE id = $2")
                    .bind(new_symbol)
                    .bind(id)
                    .execute(self.pool.deref())
                    .await?;
                Ok(())
            }

            async fn deactivate_all_for_path(&self, path: &str) -> Result<u64, RepoError> {
                let result = sqlx::query(
                    "UPDATE entities SET is_active = false, is_orphaned = true WHERE path = $1 AND is_active = true",
                )
                .bind(path)
                .execute(self.pool.deref())
                .await?;
                Ok(result.rows_affected())
            }

            async fn deactivate_missing_symbols(
                &self,
                path: &str,
                remaining_symbols: &[String],
            ) -> Result<u64, RepoError> {
                let active = self.list_active_by_path(path).await?;
                let mut count = 0u64;
                for entity in active {
                    if !remaining_symbols.contains(&entity.function_symbol) {
                        sqlx::query("UPDATE entities SET is_active = false WHERE id = $1")
                            .bind(entity.id)
                            .execute(self.pool.deref())
                            .await?;
                        count += 1;
                    }
                }
                Ok(count)
            }
        }
    };
}

impl_sql_entity_repo!(
    sqlx::Postgres,
    r#"
    INSERT INTO entities (id, name, function_symbol, path, kind, description, category, tags,
        parameters_schema, endpoint_enabled, allowed_methods, execution_mode, timeout_seconds,
        cache_ttl_seconds, is_active, is_orphaned, last_seen_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (id) DO UPDATE SET
        name = $2, function_symbol = $3, path = $4, kind = $5, description = $6, category = $7,
        tags = $8, parameters_schema = $9, endpoint_enabled = $10, allowed_methods = $11,
        execution_mode = $12, timeout_seconds = $13, cache_ttl_seconds = $14, is_active = $15,
        is_orphaned = $16, last_seen_at = $17
    RETURNING *
    "#,
    r#"
    INSERT INTO entities (id, name, function_symbol, path, kind, description, category, tags,
        parameters_schema, endpoint_enabled, allowed_methods, execution_mode, timeout_seconds,
        cache_ttl_seconds, is_active, is_orphaned, last_seen_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (path, function_symbol) DO UPDATE SET
        name = $2, kind = $5, description = $6, category = $7, tags = $8,
        parameters_schema = $9, endpoint_enabled = $10, allowed_methods = $11,
        execution_mode = $12, timeout_seconds = $13, cache_ttl_seconds = $14, is_active = $15,
        is_orphaned = $16, last_seen_at = $17
    RETURNING *
    "#
);

impl_sql_entity_repo!(
    sqlx::Sqlite,
    r#"
    INSERT INTO entities (id, name, function_symbol, path, kind, description, category, tags,
        parameters_schema, endpoint_enabled, allowed_methods, execution_mode, timeout_seconds,
        cache_ttl_seconds, is_active, is_orphaned, last_seen_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (id) DO UPDATE SET
        name = excluded.name, function_symbol = excluded.function_symbol, path = excluded.path,
        kind = excluded.kind, description = excluded.description, category = excluded.category,
        tags = excluded.tags, parameters_schema = excluded.parameters_schema,
        endpoint_enabled = excluded.endpoint_enabled, allowed_methods = excluded.allowed_methods,
        execution_mode = excluded.execution_mode, timeout_seconds = excluded.timeout_seconds,
        cache_ttl_seconds = excluded.cache_ttl_seconds, is_active = excluded.is_active,
        is_orphaned = excluded.is_orphaned, last_seen_at = excluded.last_seen_at
    RETURNING *
    "#,
    r#"
    INSERT INTO entities (id, name, function_symbol, path, kind, description, category, tags,
        parameters_schema, endpoint_enabled, allowed_methods, execution_mode, timeout_seconds,
        cache_ttl_seconds, is_active, is_orphaned, last_seen_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
    ON CONFLICT (path, function_symbol) DO UPDATE SET
        name = excluded.name, kind = excluded.kind, description = excluded.description,
        category = excluded.category, tags = excluded.tags,
        parameters_schema = excluded.parameters_schema, endpoint_enabled = excluded.endpoint_enabled,
        allowed_methods = excluded.allowed_methods, execution_mode = excluded.execution_mode,
        timeout_seconds = excluded.timeout_seconds, cache_ttl_seconds = excluded.cache_ttl_seconds,
        is_active = excluded.is_active, is_orphaned = excluded.is_orphaned,
        last_seen_at = excluded.last_seen_at
    RETURNING *
    "#
);

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn sample(path: &str, symbol: &str) -> Entity {
        Entity {
            id: Uuid::new_v4(),
            name: symbol.to_string(),
            function_symbol: symbol.to_string(),
            path: path.to_string(),
            kind: EntityKind::Workflow,
            description: None,
            category: "General".to_string(),
            tags: vec![],
            parameters_schema: vec![],
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

    #[test_r::test(tokio::test)]
    async fn upsert_same_identity_key_preserves_id() {
        let repo = InMemoryEntityRepo::new();
        let first = repo.upsert(sample("wf/a.py", "greet")).await.unwrap();
        let mut second = sample("wf/a.py", "greet");
        second.description = Some("updated".to_string());
        let upserted = repo.upsert(second).await.unwrap();
        assert_eq!(first.id, upserted.id);
    }

    #[test_r::test(tokio::test)]
    async fn rename_preserves_id_and_updates_symbol() {
        let repo = InMemoryEntityRepo::new();
        let entity = repo.upsert(sample("wf/a.py", "greet")).await.unwrap();
        repo.rename_function_symbol(entity.id, "hello_world").await.unwrap();
        let renamed = repo.find_by_id(entity.id).await.unwrap().unwrap();
        assert_eq!(renamed.function_symbol, "hello_world");
        assert_eq!(renamed.id, entity.id);
    }

    #[test_r::test(tokio::test)]
    async fn deactivate_missing_symbols_only_removes_gone_ones() {
        let repo = InMemoryEntityRepo::new();
        repo.upsert(sample("wf/a.py", "greet")).await.unwrap();
        repo.upsert(sample("wf/a.py", "farewell")).await.unwrap();
        let count = repo
            .deactivate_missing_symbols("wf/a.py", &["greet".to_string()])
            .await
            .unwrap();
        assert_eq!(count, 1);
        let active = repo.list_active_by_path("wf/a.py").await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].function_symbol, "greet");
    }
}
