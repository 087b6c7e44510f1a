//! Migration error types.

use crate::model::MigrationConflict;

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Migration error type.
///
/// Every variant here is raised out-of-band: a step that fails while the
/// engine is iterating steps is recorded inside the
/// [`MigrationResult`](crate::model::MigrationResult) instead.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// Database connection error.
    #[error("Database connection error: {0}")]
    Connection(String),

    /// SQL execution error.
    #[error("SQL execution error: {0}")]
    Execution(String),

    /// Migration not found.
    #[error("Migration not found: {id}")]
    NotFound {
        /// Migration id that was not found.
        id: String,
    },

    /// Checksum mismatch.
    #[error("Checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// What was being verified (migration id, export, backup).
        subject: String,
        /// Expected checksum.
        expected: String,
        /// Actual checksum.
        actual: String,
    },

    /// The migration was rejected by the validator before any step ran.
    #[error("Migration {migration_id} failed validation: {}", errors.join("; "))]
    ValidationFailed {
        /// Migration id.
        migration_id: String,
        /// Validation error messages.
        errors: Vec<String>,
    },

    /// The migration conflicts critically with applied migrations.
    #[error("Migration {migration_id} has {} critical conflict(s)", conflicts.len())]
    ConflictDetected {
        /// Migration id.
        migration_id: String,
        /// The critical conflicts.
        conflicts: Vec<MigrationConflict>,
    },

    /// Dependency ordering could not be completed.
    #[error("Circular dependency or missing dependency among: {}", unresolved.join(", "))]
    UnresolvedDependencies {
        /// Ids left over when no further progress was possible.
        unresolved: Vec<String>,
    },

    /// Rollback not supported.
    #[error("Migration {id} does not support rollback: {reason}")]
    RollbackNotSupported {
        /// Migration id.
        id: String,
        /// Why rollback is unavailable.
        reason: String,
    },

    /// No successful execution exists to roll back.
    #[error("Migration {id} has no successful execution to roll back")]
    NotApplied {
        /// Migration id.
        id: String,
    },

    /// Backup creation or lookup failed.
    #[error("Backup error: {0}")]
    Backup(String),

    /// Unknown transport format tag.
    #[error("Unsupported migration format: {0}")]
    UnsupportedFormat(String),

    /// Invalid semantic version.
    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion {
        /// Version text.
        version: String,
        /// Parser message.
        reason: String,
    },

    /// Invalid migration definition.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Import data failed pre-write validation.
    #[error("Invalid import data: {0}")]
    InvalidData(String),

    /// Data transform or expression failure.
    #[error("Transform error: {0}")]
    Transform(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Pool error.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Timeout error.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Lock acquisition failed.
    #[error("Failed to acquire migration lock: {0}")]
    LockFailed(String),

    /// A session with this id is already running.
    #[error("Session {0} is already running")]
    DuplicateSession(String),

    /// Database not supported.
    #[error("Database type not supported: {0}")]
    UnsupportedDatabase(String),
}

impl MigrationError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create an execution error.
    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transform error.
    pub fn transform(msg: impl Into<String>) -> Self {
        Self::Transform(msg.into())
    }

    /// Check if the error is retryable.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout(_) | Self::LockFailed(_)
        )
    }

    /// Whether the database itself became unusable, as opposed to one
    /// statement failing. Such errors abort a run instead of failing a step.
    #[must_use]
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Pool(_) | Self::Io(_))
    }

    /// Whether this error rejected a run before any step executed.
    #[must_use]
    pub fn is_preflight_rejection(&self) -> bool {
        matches!(
            self,
            Self::ValidationFailed { .. } | Self::ConflictDetected { .. }
        )
    }
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(e) => Self::Config(e.to_string()),
            sqlx::Error::Database(e) => Self::Execution(e.to_string()),
            sqlx::Error::Io(e) => Self::Io(e),
            sqlx::Error::PoolTimedOut => Self::Timeout("Connection pool timed out".to_string()),
            sqlx::Error::PoolClosed => Self::Pool("Connection pool is closed".to_string()),
            _ => Self::Execution(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for MigrationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
