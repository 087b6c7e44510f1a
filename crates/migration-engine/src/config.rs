//! Engine configuration.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Database engine a migration can target.
///
/// PostgreSQL is the canonical dialect: `universal` SQL is written for it and
/// every other engine's SQL is derived from that text.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    /// PostgreSQL database.
    #[default]
    PostgreSQL,
    /// MySQL / MariaDB database.
    MySQL,
    /// SQLite database.
    SQLite,
    /// Microsoft SQL Server.
    MSSQL,
    /// Oracle database.
    Oracle,
}

impl DatabaseEngine {
    /// All supported engines.
    pub const ALL: [Self; 5] = [
        Self::PostgreSQL,
        Self::MySQL,
        Self::SQLite,
        Self::MSSQL,
        Self::Oracle,
    ];

    /// Parse from a database URL.
    #[must_use]
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if url.starts_with("sqlite://") || url.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else if url.starts_with("mysql://") || url.starts_with("mariadb://") {
            Some(Self::MySQL)
        } else if url.starts_with("mssql://") || url.starts_with("sqlserver://") {
            Some(Self::MSSQL)
        } else if url.starts_with("oracle://") {
            Some(Self::Oracle)
        } else {
            None
        }
    }

    /// Positional parameter placeholder for the 1-based `index`.
    #[must_use]
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Self::PostgreSQL | Self::SQLite => format!("${index}"),
            Self::MySQL => "?".to_string(),
            Self::MSSQL => format!("@p{index}"),
            Self::Oracle => format!(":{index}"),
        }
    }

    /// Quote an identifier (table or column name).
    #[must_use]
    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            Self::MySQL => format!("`{}`", ident.replace('`', "``")),
            Self::MSSQL => format!("[{}]", ident.replace(']', "]]")),
            Self::PostgreSQL | Self::SQLite | Self::Oracle => {
                format!("\"{}\"", ident.replace('"', "\"\""))
            }
        }
    }
}

impl std::fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PostgreSQL => write!(f, "postgresql"),
            Self::MySQL => write!(f, "mysql"),
            Self::SQLite => write!(f, "sqlite"),
            Self::MSSQL => write!(f, "mssql"),
            Self::Oracle => write!(f, "oracle"),
        }
    }
}

impl std::str::FromStr for DatabaseEngine {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "postgresql" | "postgres" | "pg" => Ok(Self::PostgreSQL),
            "mysql" | "mariadb" => Ok(Self::MySQL),
            "sqlite" => Ok(Self::SQLite),
            "mssql" | "sqlserver" => Ok(Self::MSSQL),
            "oracle" => Ok(Self::Oracle),
            other => Err(MigrationError::UnsupportedDatabase(other.to_string())),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Database connection URL.
    #[serde(default)]
    pub database_url: String,

    /// Database engine (auto-detected from the URL if not specified).
    #[serde(default)]
    pub database_engine: DatabaseEngine,

    /// Execution log table name.
    #[serde(default = "default_execution_log_table")]
    pub execution_log_table: String,

    /// Step log table name.
    #[serde(default = "default_step_log_table")]
    pub step_log_table: String,

    /// Connection timeout.
    #[serde(with = "humantime_serde", default = "default_connect_timeout")]
    pub connect_timeout: Duration,

    /// Maximum connection pool size.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a run waits for the per-plugin lock.
    #[serde(with = "humantime_serde", default = "default_lock_timeout")]
    pub lock_timeout: Duration,

    /// Batch size used when the execution context does not set one.
    #[serde(default = "default_batch_size")]
    pub default_batch_size: usize,

    /// Estimated durations above this produce a validation warning.
    #[serde(with = "humantime_serde", default = "default_performance_threshold")]
    pub performance_warning_threshold: Duration,

    /// Directory backup snapshots are written to.
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    /// Directory holding migration envelopes, one sub-directory per plugin.
    #[serde(default)]
    pub catalog_dir: Option<PathBuf>,
}

fn default_execution_log_table() -> String {
    "migration_execution_log".to_string()
}

fn default_step_log_table() -> String {
    "migration_step_log".to_string()
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_connections() -> u32 {
    5
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_batch_size() -> usize {
    1000
}

fn default_performance_threshold() -> Duration {
    Duration::from_secs(300)
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("backups")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            database_engine: DatabaseEngine::PostgreSQL,
            execution_log_table: default_execution_log_table(),
            step_log_table: default_step_log_table(),
            connect_timeout: default_connect_timeout(),
            max_connections: default_max_connections(),
            lock_timeout: default_lock_timeout(),
            default_batch_size: default_batch_size(),
            performance_warning_threshold: default_performance_threshold(),
            backup_dir: default_backup_dir(),
            catalog_dir: None,
        }
    }
}

impl EngineConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Load configuration from a TOML or YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let mut config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)
                .map_err(|e| MigrationError::config(format!("{}: {e}", path.display())))?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)
                .map_err(|e| MigrationError::config(format!("{}: {e}", path.display())))?,
            _ => {
                return Err(MigrationError::config(format!(
                    "Unsupported config file extension: {}",
                    path.display()
                )))
            }
        };

        if let Some(engine) = DatabaseEngine::from_url(&config.database_url) {
            config.database_engine = engine;
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(MigrationError::config("Database URL is required"));
        }

        if self.execution_log_table.is_empty() || self.step_log_table.is_empty() {
            return Err(MigrationError::config("Audit table names are required"));
        }

        if self.execution_log_table == self.step_log_table {
            return Err(MigrationError::config(
                "Execution log and step log tables must differ",
            ));
        }

        if self.max_connections == 0 {
            return Err(MigrationError::config(
                "Max connections must be greater than 0",
            ));
        }

        if self.default_batch_size == 0 {
            return Err(MigrationError::config("Batch size must be greater than 0"));
        }

        Ok(())
    }
}

/// Builder for engine configuration.
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the database URL.
    #[must_use]
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        // Auto-detect the engine if possible
        if let Some(engine) = DatabaseEngine::from_url(&url) {
            self.config.database_engine = engine;
        }
        self.config.database_url = url;
        self
    }

    /// Set the database engine.
    #[must_use]
    pub fn database_engine(mut self, engine: DatabaseEngine) -> Self {
        self.config.database_engine = engine;
        self
    }

    /// Set the audit table names.
    #[must_use]
    pub fn audit_tables(
        mut self,
        execution_log: impl Into<String>,
        step_log: impl Into<String>,
    ) -> Self {
        self.config.execution_log_table = execution_log.into();
        self.config.step_log_table = step_log.into();
        self
    }

    /// Set the connection timeout.
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set maximum connections.
    #[must_use]
    pub fn max_connections(mut self, max: u32) -> Self {
        self.config.max_connections = max;
        self
    }

    /// Set the plugin lock timeout.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the default batch size.
    #[must_use]
    pub fn default_batch_size(mut self, size: usize) -> Self {
        self.config.default_batch_size = size;
        self
    }

    /// Set the performance warning threshold.
    #[must_use]
    pub fn performance_warning_threshold(mut self, threshold: Duration) -> Self {
        self.config.performance_warning_threshold = threshold;
        self
    }

    /// Set the backup directory.
    #[must_use]
    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.backup_dir = dir.into();
        self
    }

    /// Set the catalog directory.
    #[must_use]
    pub fn catalog_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.catalog_dir = Some(dir.into());
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
