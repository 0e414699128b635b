use std::error::Error;

use bifrost_common::config::{DbPostgresConfig, DbSqliteConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Postgres, Sqlite};
use tracing::info;

impl From<&DbPostgresConfig> for PgConnectOptions {
    fn from(config: &DbPostgresConfig) -> Self {
        PgConnectOptions::new()
            .host(config.host.as_str())
            .port(config.port)
            .database(config.database.as_str())
            .username(config.username.as_str())
            .password(config.password.as_str())
    }
}

impl From<&DbSqliteConfig> for SqliteConnectOptions {
    fn from(config: &DbSqliteConfig) -> Self {
        SqliteConnectOptions::new()
            .filename(std::path::Path::new(config.database.as_str()))
            .create_if_missing(true)
    }
}

pub async fn create_postgres_pool(config: &DbPostgresConfig) -> Result<Pool<Postgres>, Box<dyn Error>> {
    info!("DB pool: postgresql://{}:{}/{}", config.host, config.port, config.database);
    let conn_options = PgConnectOptions::from(config);
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn migrate_postgres(pool: &Pool<Postgres>) -> Result<(), Box<dyn Error>> {
    info!("running postgres migrations");
    sqlx::migrate!("./db/migration/postgres").run(pool).await?;
    Ok(())
}

pub async fn create_sqlite_pool(config: &DbSqliteConfig) -> Result<Pool<Sqlite>, Box<dyn Error>> {
    info!("DB pool: sqlite://{}", config.database);
    let conn_options = SqliteConnectOptions::from(config);
    SqlitePoolOptions::new()
        .max_connections(config.max_connections)
        .connect_with(conn_options)
        .await
        .map_err(|e| e.into())
}

pub async fn migrate_sqlite(pool: &Pool<Sqlite>) -> Result<(), Box<dyn Error>> {
    info!("running sqlite migrations");
    sqlx::migrate!("./db/migration/sqlite").run(pool).await?;
    Ok(())
}
