//! Database collaborator.
//!
//! The engine only talks to the database through [`DatabaseClient`]. Parameters
//! and rows are JSON values so the same code path serves every driver;
//! [`SqlxDatabase`] is the production implementation over an `sqlx::AnyPool`.

use crate::config::{DatabaseEngine, EngineConfig};
use crate::error::{MigrationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Column, Row as _, ValueRef};
use std::time::Duration;

/// A result row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Parameterized query access to one database.
#[async_trait]
pub trait DatabaseClient: Send + Sync {
    /// Engine behind this client.
    fn engine(&self) -> DatabaseEngine;

    /// Run a query and return every row.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Run a query and return the first row.
    async fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params).await?.into_iter().next())
    }

    /// Run a statement and return the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Open a transaction.
    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>>;

    /// Names of base tables starting with `prefix`, sorted.
    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>>;

    /// Whether a table exists.
    async fn table_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_tables(name).await?.iter().any(|t| t == name))
    }
}

/// An open transaction. Dropping it without `commit` rolls it back.
#[async_trait]
pub trait DatabaseTransaction: Send {
    /// Run a statement and return the affected row count.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query and return every row.
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Commit.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Roll back.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of connections.
    pub max_connections: u32,
    /// Minimum number of connections.
    pub min_connections: u32,
    /// Connection timeout.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Idle timeout for connections.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Whether to test connections on checkout.
    pub test_on_acquire: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            test_on_acquire: true,
        }
    }
}

impl PoolConfig {
    /// Create a new builder.
    #[must_use]
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }

    /// Pool settings implied by an engine configuration.
    #[must_use]
    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            connect_timeout: config.connect_timeout,
            ..Self::default()
        }
    }
}

/// Builder for pool configuration.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    config: PoolConfig,
}

impl PoolConfigBuilder {
    /// Set maximum connections.
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set minimum connections.
    #[must_use]
    pub fn min_connections(mut self, min: u32) -> Self {
        self.config.min_connections = min;
        self
    }

    /// Set connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set idle timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Set test on acquire.
    #[must_use]
    pub fn test_on_acquire(mut self, test: bool) -> Self {
        self.config.test_on_acquire = test;
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> PoolConfig {
        self.config
    }
}

/// [`DatabaseClient`] over an sqlx `AnyPool`. PostgreSQL and SQLite only.
pub struct SqlxDatabase {
    pool: AnyPool,
    engine: DatabaseEngine,
}

impl SqlxDatabase {
    /// Connect using an engine configuration.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        Self::with_pool_config(config, PoolConfig::from_engine_config(config)).await
    }

    /// Connect with explicit pool settings.
    pub async fn with_pool_config(config: &EngineConfig, pool_config: PoolConfig) -> Result<Self> {
        let engine = DatabaseEngine::from_url(&config.database_url)
            .unwrap_or(config.database_engine);
        if !matches!(engine, DatabaseEngine::PostgreSQL | DatabaseEngine::SQLite) {
            return Err(MigrationError::UnsupportedDatabase(engine.to_string()));
        }

        sqlx::any::install_default_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.min_connections)
            .acquire_timeout(pool_config.connect_timeout)
            .idle_timeout(Some(pool_config.idle_timeout))
            .test_before_acquire(pool_config.test_on_acquire)
            .connect(&config.database_url)
            .await
            .map_err(|e| MigrationError::Connection(e.to_string()))?;

        tracing::debug!(engine = %engine, max_connections = pool_config.max_connections, "Database pool ready");

        Ok(Self { pool, engine })
    }
}

impl std::fmt::Debug for SqlxDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlxDatabase")
            .field("engine", &self.engine)
            .field("connections", &self.pool.size())
            .finish()
    }
}

fn bind_all<'q>(sql: &'q str, params: &[Value]) -> Query<'q, Any, AnyArguments<'q>> {
    params.iter().fold(sqlx::query(sql), |q, param| match param {
        Value::Null => q.bind(None::<String>),
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => q.bind(i),
            None => q.bind(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => q.bind(s.clone()),
        other => q.bind(other.to_string()),
    })
}

fn decode_row(row: &AnyRow) -> Result<Row> {
    let mut out = Row::new();
    for column in row.columns() {
        let i = column.ordinal();
        let is_null = row
            .try_get_raw(i)
            .map(|raw| raw.is_null())
            .map_err(MigrationError::from)?;
        let value = if is_null {
            Value::Null
        } else if let Ok(v) = row.try_get::<i64, _>(i) {
            Value::from(v)
        } else if let Ok(v) = row.try_get::<f64, _>(i) {
            serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number)
        } else if let Ok(v) = row.try_get::<bool, _>(i) {
            Value::Bool(v)
        } else if let Ok(v) = row.try_get::<String, _>(i) {
            Value::String(v)
        } else if let Ok(v) = row.try_get::<Vec<u8>, _>(i) {
            Value::String(hex::encode(v))
        } else {
            return Err(MigrationError::execution(format!(
                "column '{}' has an unsupported type",
                column.name()
            )));
        };
        out.insert(column.name().to_string(), value);
    }
    Ok(out)
}

fn list_tables_sql(engine: DatabaseEngine) -> &'static str {
    match engine {
        DatabaseEngine::SQLite => {
            "SELECT name AS table_name FROM sqlite_master \
             WHERE type = 'table' AND name LIKE $1 ORDER BY name"
        }
        _ => {
            "SELECT table_name::text AS table_name FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_type = 'BASE TABLE' \
             AND table_name LIKE $1 ORDER BY table_name"
        }
    }
}

#[async_trait]
impl DatabaseClient for SqlxDatabase {
    fn engine(&self) -> DatabaseEngine {
        self.engine
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = bind_all(sql, params).fetch_all(&self.pool).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let done = bind_all(sql, params).execute(&self.pool).await?;
        Ok(done.rows_affected())
    }

    async fn begin(&self) -> Result<Box<dyn DatabaseTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqlxTransaction { tx }))
    }

    async fn list_tables(&self, prefix: &str) -> Result<Vec<String>> {
        let rows = self
            .query(list_tables_sql(self.engine), &[Value::String(format!("{prefix}%"))])
            .await?;
        // LIKE treats `_` as a wildcard, so re-check the prefix literally
        Ok(rows
            .into_iter()
            .filter_map(|mut r| match r.remove("table_name") {
                Some(Value::String(name)) if name.starts_with(prefix) => Some(name),
                _ => None,
            })
            .collect())
    }
}

struct SqlxTransaction {
    tx: sqlx::Transaction<'static, Any>,
}

#[async_trait]
impl DatabaseTransaction for SqlxTransaction {
    async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let done = bind_all(sql, params).execute(&mut *self.tx).await?;
        Ok(done.rows_affected())
    }

    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let rows = bind_all(sql, params).fetch_all(&mut *self.tx).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::builder()
            .max_connections(20)
            .min_connections(2)
            .connect_timeout(Duration::from_secs(60))
            .test_on_acquire(false)
            .build();

        assert_eq!(config.max_connections, 20);
        assert_eq!(config.min_connections, 2);
        assert_eq!(config.connect_timeout, Duration::from_secs(60));
        assert!(!config.test_on_acquire);
    }

    #[test]
    fn test_pool_config_from_engine_config() {
        let engine_config = EngineConfig {
            max_connections: 3,
            connect_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let pool = PoolConfig::from_engine_config(&engine_config);
        assert_eq!(pool.max_connections, 3);
        assert_eq!(pool.connect_timeout, Duration::from_secs(5));
        assert_eq!(pool.min_connections, 1);
    }

    #[tokio::test]
    async fn test_unsupported_engine_rejected() {
        let config = EngineConfig {
            database_url: "mysql://localhost/plugins".to_string(),
            ..EngineConfig::default()
        };
        let err = SqlxDatabase::connect(&config).await.unwrap_err();
        assert!(matches!(err, MigrationError::UnsupportedDatabase(_)));
    }

    #[tokio::test]
    async fn test_sqlite_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            database_url: format!("sqlite://{}?mode=rwc", dir.path().join("t.db").display()),
            ..EngineConfig::default()
        };
        let db = SqlxDatabase::connect(&config).await.unwrap();
        assert_eq!(db.engine(), DatabaseEngine::SQLite);

        db.execute(
            "CREATE TABLE blog_posts (id INTEGER PRIMARY KEY, title TEXT, score REAL)",
            &[],
        )
        .await
        .unwrap();
        let affected = db
            .execute(
                "INSERT INTO blog_posts (id, title, score) VALUES ($1, $2, $3)",
                &[Value::from(1), Value::from("hello"), Value::Null],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let row = db
            .query_one("SELECT id, title, score FROM blog_posts", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["id"], Value::from(1));
        assert_eq!(row["title"], Value::from("hello"));
        assert_eq!(row["score"], Value::Null);

        assert_eq!(db.list_tables("blog").await.unwrap(), vec!["blog_posts"]);
        assert!(db.table_exists("blog_posts").await.unwrap());
        assert!(!db.table_exists("blog").await.unwrap());

        let mut tx = db.begin().await.unwrap();
        tx.execute("DELETE FROM blog_posts", &[]).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(db.query("SELECT id FROM blog_posts", &[]).await.unwrap().len(), 1);
    }
}
