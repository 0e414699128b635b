use async_trait::async_trait;
use bifrost_common::model::IndexedText;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::{Database, Pool};
use std::ops::Deref;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TextIndexError {
    #[error("path not found: {0}")]
    NotFound(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Path-keyed table of `(path, content, content_hash, updated_at)` for
/// full-text and prefix search (C2). Single row per path; `upsert` is
/// idempotent and `updated_at` always advances to `now`.
#[async_trait]
pub trait TextIndex: Send + Sync {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TextIndexError>;

    async fn get(&self, path: &str) -> Result<Option<IndexedText>, TextIndexError>;

    async fn delete(&self, path: &str) -> Result<(), TextIndexError>;

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<IndexedText>, TextIndexError>;
}

#[derive(Default)]
pub struct InMemoryTextIndex {
    rows: DashMap<String, IndexedText>,
}

impl InMemoryTextIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TextIndex for InMemoryTextIndex {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TextIndexError> {
        self.rows.insert(
            path.to_string(),
            IndexedText {
                path: path.to_string(),
                content: content.to_string(),
                content_hash: content_hash.to_string(),
                updated_at: now,
            },
        );
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<IndexedText>, TextIndexError> {
        Ok(self.rows.get(path).map(|entry| entry.clone()))
    }

    async fn delete(&self, path: &str) -> Result<(), TextIndexError> {
        self.rows.remove(path);
        Ok(())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<IndexedText>, TextIndexError> {
        let mut out: Vec<IndexedText> = self
            .rows
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|row| row.path.starts_with(prefix))
            .collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out.truncate(limit);
        Ok(out)
    }
}

#[derive(sqlx::FromRow)]
struct IndexedTextRow {
    path: String,
    content: String,
    content_hash: String,
    updated_at: DateTime<Utc>,
}

impl From<IndexedTextRow> for IndexedText {
    fn from(row: IndexedTextRow) -> Self {
        IndexedText {
            path: row.path,
            content: row.content,
            content_hash: row.content_hash,
            updated_at: row.updated_at,
        }
    }
}

/// `sqlx`-backed `TextIndex`, generic over the backend the way
/// `cloud-component-service/src/repo/component.rs` is generic over
/// `DB: Database` via per-backend trait impls.
pub struct SqlTextIndex<DB: Database> {
    pool: Arc<Pool<DB>>,
}

impl<DB: Database> SqlTextIndex<DB> {
    pub fn new(pool: Arc<Pool<DB>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TextIndex for SqlTextIndex<sqlx::Postgres> {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TextIndexError> {
        sqlx::query(
            r#"
            INSERT INTO indexed_text (path, content, content_hash, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (path) DO UPDATE
            SET content = $2, content_hash = $3, updated_at = $4
            "#,
        )
        .bind(path)
        .bind(content)
        .bind(content_hash)
        .bind(now)
        .execute(self.pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<IndexedText>, TextIndexError> {
        let row = sqlx::query_as::<_, IndexedTextRow>(
            "SELECT path, content, content_hash, updated_at FROM indexed_text WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(self.pool.deref())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, path: &str) -> Result<(), TextIndexError> {
        sqlx::query("DELETE FROM indexed_text WHERE path = $1")
            .bind(path)
            .execute(self.pool.deref())
            .await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<IndexedText>, TextIndexError> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query_as::<_, IndexedTextRow>(
            "SELECT path, content, content_hash, updated_at FROM indexed_text WHERE path LIKE $1 ORDER BY path LIMIT $2",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(self.pool.deref())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl TextIndex for SqlTextIndex<sqlx::Sqlite> {
    async fn upsert(
        &self,
        path: &str,
        content: &str,
        content_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<(), TextIndexError> {
        sqlx::query(
            r#"
            INSERT INTO indexed_text (path, content, content_hash, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (path) DO UPDATE
            SET content = excluded.content, content_hash = excluded.content_hash, updated_at = excluded.updated_at
            "#,
        )
        .bind(path)
        .bind(content)
        .bind(content_hash)
        .bind(now)
        .execute(self.pool.deref())
        .await?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<IndexedText>, TextIndexError> {
        let row = sqlx::query_as::<_, IndexedTextRow>(
            "SELECT path, content, content_hash, updated_at FROM indexed_text WHERE path = $1",
        )
        .bind(path)
        .fetch_optional(self.pool.deref())
        .await?;
        Ok(row.map(Into::into))
    }

    async fn delete(&self, path: &str) -> Result<(), TextIndexError> {
        sqlx::query("DELETE FROM indexed_text WHERE path = $1")
            .bind(path)
            .execute(self.pool.deref())
            .await?;
        Ok(())
    }

    async fn scan(&self, prefix: &str, limit: usize) -> Result<Vec<IndexedText>, TextIndexError> {
        let pattern = format!("{prefix}%");
        let rows = sqlx::query_as::<_, IndexedTextRow>(
            "SELECT path, content, content_hash, updated_at FROM indexed_text WHERE path LIKE $1 ORDER BY path LIMIT $2",
        )
        .bind(pattern)
        .bind(limit as i64)
        .fetch_all(self.pool.deref())
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test_r::test(tokio::test)]
    async fn upsert_then_get_round_trips() {
        let index = InMemoryTextIndex::new();
        let now = Utc::now();
        index.upsert("wf/hello.py", "print(1)", "abc123", now).await.unwrap();
        let row = index.get("wf/hello.py").await.unwrap().unwrap();
        assert_eq!(row.content_hash, "abc123");
        assert_eq!(row.updated_at, now);
    }

    #[test_r::test(tokio::test)]
    async fn upsert_is_idempotent_and_advances_updated_at() {
        let index = InMemoryTextIndex::new();
        let t1 = Utc::now();
        index.upsert("a.py", "x", "h1", t1).await.unwrap();
        let t2 = t1 + chrono::Duration::seconds(5);
        index.upsert("a.py", "x", "h1", t2).await.unwrap();
        let row = index.get("a.py").await.unwrap().unwrap();
        assert_eq!(row.updated_at, t2);
    }

    #[test_r::test(tokio::test)]
    async fn scan_respects_prefix_and_limit() {
        let index = InMemoryTextIndex::new();
        let now = Utc::now();
        for p in ["wf/a.py", "wf/b.py", "forms/c.form.yaml"] {
            index.upsert(p, "", "h", now).await.unwrap();
        }
        let rows = index.scan("wf/", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
    }
}
