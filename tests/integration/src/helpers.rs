//! Test helper utilities for integration tests

use migration_engine::{
    DatabaseEngine, EngineConfig, MigrationEngine, MigrationExecutionContext, Result,
};
use once_cell::sync::Lazy;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for tests (only once)
static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
});

/// Initialize tracing for tests
pub fn init_tracing() {
    Lazy::force(&TRACING);
}

/// A SQLite database file in a temporary directory plus an engine bound to it.
pub struct TestDatabase {
    /// Engine connected to the database
    pub engine: MigrationEngine,
    dir: TempDir,
}

impl TestDatabase {
    /// Create an empty database with default settings.
    pub async fn new() -> Result<Self> {
        Self::with_config(|config| config).await
    }

    /// Create an empty database, letting the caller adjust the configuration.
    pub async fn with_config(adjust: impl FnOnce(EngineConfig) -> EngineConfig) -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let config = EngineConfig {
            database_url: format!("sqlite://{}?mode=rwc", dir.path().join("plugins.db").display()),
            database_engine: DatabaseEngine::SQLite,
            backup_dir: dir.path().join("backups"),
            lock_timeout: Duration::from_secs(5),
            ..EngineConfig::default()
        };
        let engine = MigrationEngine::connect(adjust(config)).await?;
        engine.init().await?;
        Ok(Self { engine, dir })
    }

    /// Temporary directory holding the database file.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Directory backups are written to.
    pub fn backup_dir(&self) -> PathBuf {
        self.dir.path().join("backups")
    }

    /// Execution context for this database.
    pub fn context(&self) -> MigrationExecutionContext {
        MigrationExecutionContext::new(DatabaseEngine::SQLite)
    }

    /// Whether `table` exists.
    pub async fn has_table(&self, table: &str) -> bool {
        self.engine
            .client()
            .table_exists(table)
            .await
            .unwrap_or(false)
    }

    /// Number of rows in `table`.
    pub async fn count(&self, table: &str) -> i64 {
        let row = self
            .engine
            .client()
            .query_one(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])
            .await
            .ok()
            .flatten();
        row.and_then(|r| r.get("n").and_then(Value::as_i64))
            .unwrap_or(-1)
    }

    /// Run raw SQL against the database.
    pub async fn execute(&self, sql: &str) -> u64 {
        self.engine
            .client()
            .execute(sql, &[])
            .await
            .unwrap_or_else(|e| panic!("{sql} failed: {e}"))
    }
}
