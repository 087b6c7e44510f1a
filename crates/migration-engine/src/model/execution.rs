//! Execution context and results.

use super::migration::{Direction, PortableMigration};
use crate::config::DatabaseEngine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Tunables for a single run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOptions {
    /// Do not create a backup even if the migration requires one.
    #[serde(default)]
    pub skip_backup: bool,
    /// Do not run the validator before executing.
    #[serde(default)]
    pub skip_validation: bool,
    /// Rows per transform/import batch; the engine default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Upper bound for the whole run.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Wrap the entire step loop in one transaction.
    #[serde(default)]
    pub atomic: bool,
}

/// Per-invocation parameters.
///
/// Each logically distinct run needs its own `session_id`;
/// [`MigrationExecutionContext::new`] generates one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationExecutionContext {
    /// Which step sequence to run.
    pub direction: Direction,
    /// Record the run without executing SQL.
    pub dry_run: bool,
    /// Proceed despite critical conflicts.
    pub force: bool,
    /// Engine the SQL is selected for.
    pub database_engine: DatabaseEngine,
    /// Unique per run.
    pub session_id: String,
    /// Run options.
    #[serde(default)]
    pub options: ExecutionOptions,
    /// Extra SQL predicate applied to transform source rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_filter: Option<String>,
    /// Who triggered the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
}

impl MigrationExecutionContext {
    /// Context for an `up` run with a fresh session id.
    #[must_use]
    pub fn new(engine: DatabaseEngine) -> Self {
        Self {
            direction: Direction::Up,
            dry_run: false,
            force: false,
            database_engine: engine,
            session_id: uuid::Uuid::new_v4().to_string(),
            options: ExecutionOptions::default(),
            data_filter: None,
            initiated_by: None,
        }
    }

    /// Copy of this context with a new session id.
    #[must_use]
    pub fn fresh_session(&self) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            ..self.clone()
        }
    }

    /// Set the direction.
    #[must_use]
    pub fn direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Enable dry-run mode.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Bypass the conflict gate.
    #[must_use]
    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    /// Replace the options.
    #[must_use]
    pub fn options(mut self, options: ExecutionOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the session id.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    /// Set the transform data filter.
    #[must_use]
    pub fn data_filter(mut self, filter: impl Into<String>) -> Self {
        self.data_filter = Some(filter.into());
        self
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Executed without error.
    Success,
    /// Errored.
    Failed,
    /// Not applicable to the selected engine.
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Per-step record inside a [`MigrationResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Step id.
    pub step_id: String,
    /// Position in the executed sequence.
    pub order_index: usize,
    /// Status.
    pub status: StepStatus,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
    /// Rows reported by the database.
    pub rows_affected: u64,
    /// Error text for failed steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The step can be undone by the down sequence.
    pub rollback_available: bool,
}

/// Tally of schema and row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSummary {
    /// Tables created.
    pub tables_created: u64,
    /// Tables altered.
    pub tables_modified: u64,
    /// Tables dropped or truncated.
    pub tables_dropped: u64,
    /// Indexes created.
    pub indexes_created: u64,
    /// Indexes dropped.
    pub indexes_dropped: u64,
    /// Rows inserted.
    pub rows_inserted: u64,
    /// Rows updated.
    pub rows_updated: u64,
    /// Rows deleted.
    pub rows_deleted: u64,
}

impl ChangeSummary {
    /// Add another tally into this one.
    pub fn absorb(&mut self, other: &Self) {
        self.tables_created += other.tables_created;
        self.tables_modified += other.tables_modified;
        self.tables_dropped += other.tables_dropped;
        self.indexes_created += other.indexes_created;
        self.indexes_dropped += other.indexes_dropped;
        self.rows_inserted += other.rows_inserted;
        self.rows_updated += other.rows_updated;
        self.rows_deleted += other.rows_deleted;
    }
}

/// In-band error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Validator rejection.
    ValidationFailed,
    /// Critical conflict.
    ConflictDetected,
    /// A step failed.
    StepFailed,
    /// Infrastructure failure.
    MigrationFailed,
    /// The run exceeded its timeout.
    Timeout,
    /// The session was cancelled.
    Cancelled,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::ConflictDetected => "CONFLICT_DETECTED",
            Self::StepFailed => "STEP_FAILED",
            Self::MigrationFailed => "MIGRATION_FAILED",
            Self::Timeout => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Error recorded inside a result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionError {
    /// Error code.
    pub code: ErrorCode,
    /// Message.
    pub message: String,
    /// Step the error belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Extra structured detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ExecutionError {
    /// Create an error without a step.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            step_id: None,
            details: None,
        }
    }

    /// Create a `STEP_FAILED` error.
    #[must_use]
    pub fn step_failed(step_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::StepFailed,
            message: message.into(),
            step_id: Some(step_id.into()),
            details: None,
        }
    }
}

/// Run metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    /// The run was a dry run.
    pub dry_run: bool,
    /// Engine the run targeted.
    pub database_engine: DatabaseEngine,
    /// The conflict gate was bypassed.
    pub forced: bool,
    /// The session was cancelled.
    pub cancelled: bool,
    /// The run hit its timeout.
    pub timed_out: bool,
    /// Who triggered the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiated_by: Option<String>,
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationResult {
    /// Migration id.
    pub migration_id: String,
    /// Plugin id.
    pub plugin_id: String,
    /// Session id.
    pub session_id: String,
    /// Direction.
    pub direction: Direction,
    /// No step failed and the run was neither cancelled nor timed out.
    pub success: bool,
    /// Executed steps, in order.
    pub steps: Vec<StepResult>,
    /// Steps in the selected sequence.
    pub total_steps: usize,
    /// Successful steps.
    pub successful_steps: usize,
    /// Failed steps.
    pub failed_steps: usize,
    /// Skipped steps.
    pub skipped_steps: usize,
    /// Start time.
    pub started_at: DateTime<Utc>,
    /// End time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Actual duration in milliseconds.
    pub duration_ms: u64,
    /// Estimated duration in milliseconds.
    pub estimated_duration_ms: u64,
    /// `actual / estimated`; 0 when there is no estimate.
    pub performance_ratio: f64,
    /// Change tally.
    pub changes: ChangeSummary,
    /// Errors.
    pub errors: Vec<ExecutionError>,
    /// Warnings.
    pub warnings: Vec<String>,
    /// At least one executed step reports rollback support.
    pub rollback_available: bool,
    /// A backup was created.
    pub backup_created: bool,
    /// Backup location.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_location: Option<String>,
    /// Metadata.
    pub metadata: ExecutionMetadata,
}

impl MigrationResult {
    /// Empty result for a run that is about to start.
    #[must_use]
    pub fn start(migration: &PortableMigration, context: &MigrationExecutionContext) -> Self {
        Self {
            migration_id: migration.id.clone(),
            plugin_id: migration.plugin_id.clone(),
            session_id: context.session_id.clone(),
            direction: context.direction,
            success: false,
            steps: Vec::new(),
            total_steps: migration.steps(context.direction).len(),
            successful_steps: 0,
            failed_steps: 0,
            skipped_steps: 0,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            estimated_duration_ms: migration.estimated_duration.saturating_mul(1000),
            performance_ratio: 0.0,
            changes: ChangeSummary::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            rollback_available: false,
            backup_created: false,
            backup_location: None,
            metadata: ExecutionMetadata {
                dry_run: context.dry_run,
                database_engine: context.database_engine,
                forced: context.force,
                cancelled: false,
                timed_out: false,
                initiated_by: context.initiated_by.clone(),
            },
        }
    }

    /// Record a step outcome and update the counters.
    pub fn record_step(&mut self, step: StepResult) {
        match step.status {
            StepStatus::Success => self.successful_steps += 1,
            StepStatus::Failed => self.failed_steps += 1,
            StepStatus::Skipped => self.skipped_steps += 1,
        }
        self.steps.push(step);
    }

    /// Compute the derived fields once the step loop is over.
    pub fn finish(&mut self, elapsed: Duration) {
        let completed = Utc::now();
        self.completed_at = Some(completed);
        self.duration_ms = elapsed.as_millis() as u64;
        self.success =
            self.failed_steps == 0 && !self.metadata.cancelled && !self.metadata.timed_out;
        self.rollback_available = self
            .steps
            .iter()
            .any(|s| s.status != StepStatus::Skipped && s.rollback_available);
        self.performance_ratio = if self.estimated_duration_ms == 0 {
            0.0
        } else {
            self.duration_ms as f64 / self.estimated_duration_ms as f64
        };
    }
}
