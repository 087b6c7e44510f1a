//! Portable migration definitions.

use crate::checksum;
use crate::config::DatabaseEngine;
use crate::error::{MigrationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change a migration makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    /// Table-level DDL.
    #[default]
    Schema,
    /// Row-level DML.
    Data,
    /// Index creation or removal.
    Index,
    /// Stored functions and procedures.
    Function,
    /// Triggers.
    Trigger,
    /// Constraints.
    Constraint,
    /// Views.
    View,
    /// Database extensions.
    Extension,
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Schema => "schema",
            Self::Data => "data",
            Self::Index => "index",
            Self::Function => "function",
            Self::Trigger => "trigger",
            Self::Constraint => "constraint",
            Self::View => "view",
            Self::Extension => "extension",
        };
        f.write_str(s)
    }
}

/// Risk of applying a migration, ordered `Low < Medium < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Additive, easily reversible.
    #[default]
    Low,
    /// Touches existing objects.
    Medium,
    /// Alters or removes data shape.
    High,
    /// Can destroy data.
    Critical,
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// Per-engine SQL text for one step.
///
/// `universal` is the canonical PostgreSQL form and is never rewritten; an
/// engine without its own entry falls back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSql {
    /// Canonical SQL.
    pub universal: String,
    /// PostgreSQL override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<String>,
    /// MySQL variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<String>,
    /// SQLite variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<String>,
    /// SQL Server variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mssql: Option<String>,
    /// Oracle variant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle: Option<String>,
}

impl StepSql {
    /// SQL that runs unchanged on every engine.
    #[must_use]
    pub fn universal(sql: impl Into<String>) -> Self {
        Self {
            universal: sql.into(),
            postgresql: None,
            mysql: None,
            sqlite: None,
            mssql: None,
            oracle: None,
        }
    }

    fn slot(&self, engine: DatabaseEngine) -> &Option<String> {
        match engine {
            DatabaseEngine::PostgreSQL => &self.postgresql,
            DatabaseEngine::MySQL => &self.mysql,
            DatabaseEngine::SQLite => &self.sqlite,
            DatabaseEngine::MSSQL => &self.mssql,
            DatabaseEngine::Oracle => &self.oracle,
        }
    }

    fn slot_mut(&mut self, engine: DatabaseEngine) -> &mut Option<String> {
        match engine {
            DatabaseEngine::PostgreSQL => &mut self.postgresql,
            DatabaseEngine::MySQL => &mut self.mysql,
            DatabaseEngine::SQLite => &mut self.sqlite,
            DatabaseEngine::MSSQL => &mut self.mssql,
            DatabaseEngine::Oracle => &mut self.oracle,
        }
    }

    /// Set the SQL for one engine.
    pub fn set(&mut self, engine: DatabaseEngine, sql: impl Into<String>) {
        *self.slot_mut(engine) = Some(sql.into());
    }

    /// Set the SQL for one engine (builder form).
    #[must_use]
    pub fn with_engine(mut self, engine: DatabaseEngine, sql: impl Into<String>) -> Self {
        self.set(engine, sql);
        self
    }

    /// SQL for `engine`, falling back to `universal`.
    #[must_use]
    pub fn for_engine(&self, engine: DatabaseEngine) -> &str {
        self.slot(engine).as_deref().unwrap_or(&self.universal)
    }

    /// Whether an engine-specific variant exists.
    #[must_use]
    pub fn has_variant(&self, engine: DatabaseEngine) -> bool {
        self.slot(engine).is_some()
    }
}

/// How a target field gets its value during a transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FieldTransform {
    /// Copy the source field unchanged.
    #[default]
    Direct,
    /// Fixed value.
    Constant {
        /// The value written to every row.
        value: serde_json::Value,
    },
    /// Sandboxed expression over the source row.
    Expression {
        /// Expression text, e.g. `upper(first_name) || ' ' || last_name`.
        expr: String,
    },
}

/// One column mapping of a data transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Source column (required for `direct`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Target column.
    pub target: String,
    /// Value derivation.
    #[serde(default)]
    pub transform: FieldTransform,
}

impl FieldMapping {
    /// Copy `source` into `target`.
    #[must_use]
    pub fn direct(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            target: target.into(),
            transform: FieldTransform::Direct,
        }
    }

    /// Write a constant into `target`.
    #[must_use]
    pub fn constant(target: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            source: None,
            target: target.into(),
            transform: FieldTransform::Constant { value },
        }
    }

    /// Evaluate `expr` into `target`.
    #[must_use]
    pub fn expression(target: impl Into<String>, expr: impl Into<String>) -> Self {
        Self {
            source: None,
            target: target.into(),
            transform: FieldTransform::Expression { expr: expr.into() },
        }
    }
}

/// Row-level copy from one table into another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransform {
    /// Table rows are read from.
    pub source_table: String,
    /// Table rows are inserted into.
    pub target_table: String,
    /// Column mappings.
    pub mapping: Vec<FieldMapping>,
    /// Optional SQL predicate applied to the source rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// Rows per insert batch; the execution context decides when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

/// What a step does: run SQL or transform rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    /// Per-engine SQL.
    Sql(StepSql),
    /// Row transform.
    Transform(DataTransform),
}

/// Expected outcome of a validation query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expectation {
    /// The query returns at least one row.
    RowsExist,
    /// The query returns no rows.
    NoRows,
    /// The first column of the first row equals `value`.
    ScalarEquals {
        /// Expected value.
        value: serde_json::Value,
    },
}

/// A query run before or after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationCheck {
    /// Read-only query.
    pub query: String,
    /// What the query must return.
    pub expect: Expectation,
}

/// Pre/post checks attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StepValidation {
    /// Checked before the step executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre: Option<ValidationCheck>,
    /// Checked after the step executes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post: Option<ValidationCheck>,
}

/// One atomic unit inside a migration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStep {
    /// Step id, unique within the migration.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// SQL or transform.
    #[serde(flatten)]
    pub action: StepAction,
    /// Run inside its own transaction.
    #[serde(default = "default_true")]
    pub transactional: bool,
    /// The step can be undone by the `down` sequence.
    #[serde(default)]
    pub rollback_supported: bool,
    /// A failure is recorded but does not stop the migration.
    #[serde(default)]
    pub skip_on_error: bool,
    /// Step ids this step logically depends on. Documentation only: steps
    /// always execute in array order.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Optional pre/post checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<StepValidation>,
}

fn default_true() -> bool {
    true
}

impl MigrationStep {
    /// A transactional SQL step.
    #[must_use]
    pub fn sql(id: impl Into<String>, universal: impl Into<String>) -> Self {
        Self::with_action(id, StepAction::Sql(StepSql::universal(universal)))
    }

    /// A transactional transform step.
    #[must_use]
    pub fn transform(id: impl Into<String>, transform: DataTransform) -> Self {
        Self::with_action(id, StepAction::Transform(transform))
    }

    fn with_action(id: impl Into<String>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            action,
            transactional: true,
            rollback_supported: false,
            skip_on_error: false,
            dependencies: Vec::new(),
            validation: None,
        }
    }

    /// Set the description.
    #[must_use]
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Provide SQL for a specific engine. No-op on transform steps.
    #[must_use]
    pub fn with_engine_sql(mut self, engine: DatabaseEngine, sql: impl Into<String>) -> Self {
        if let StepAction::Sql(ref mut step_sql) = self.action {
            step_sql.set(engine, sql);
        }
        self
    }

    /// Run outside a transaction.
    #[must_use]
    pub fn non_transactional(mut self) -> Self {
        self.transactional = false;
        self
    }

    /// Declare that `down` can undo this step.
    #[must_use]
    pub fn reversible(mut self) -> Self {
        self.rollback_supported = true;
        self
    }

    /// Continue the migration if this step fails.
    #[must_use]
    pub fn skip_on_error(mut self) -> Self {
        self.skip_on_error = true;
        self
    }

    /// Declare intra-migration step dependencies.
    #[must_use]
    pub fn depends_on(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    /// Attach a pre-execution check.
    #[must_use]
    pub fn pre_check(mut self, query: impl Into<String>, expect: Expectation) -> Self {
        self.validation.get_or_insert_with(StepValidation::default).pre = Some(ValidationCheck {
            query: query.into(),
            expect,
        });
        self
    }

    /// Attach a post-execution check.
    #[must_use]
    pub fn post_check(mut self, query: impl Into<String>, expect: Expectation) -> Self {
        self.validation.get_or_insert_with(StepValidation::default).post = Some(ValidationCheck {
            query: query.into(),
            expect,
        });
        self
    }

    /// SQL for `engine`, or `None` for transform steps.
    #[must_use]
    pub fn sql_for(&self, engine: DatabaseEngine) -> Option<&str> {
        match &self.action {
            StepAction::Sql(sql) => Some(sql.for_engine(engine)),
            StepAction::Transform(_) => None,
        }
    }

    /// Canonical SQL, or `None` for transform steps.
    #[must_use]
    pub fn universal_sql(&self) -> Option<&str> {
        match &self.action {
            StepAction::Sql(sql) => Some(&sql.universal),
            StepAction::Transform(_) => None,
        }
    }
}

/// Migration direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Apply.
    #[default]
    Up,
    /// Revert.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            other => Err(MigrationError::InvalidMigration(format!(
                "unknown direction '{other}'"
            ))),
        }
    }
}

/// Immutable unit of change for one plugin version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortableMigration {
    /// Stable identifier.
    pub id: String,
    /// Owning plugin.
    pub plugin_id: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Longer description.
    #[serde(default)]
    pub description: String,
    /// Semantic version of the plugin this migration brings it to.
    pub version: String,
    /// Kind of change.
    #[serde(rename = "type", default)]
    pub migration_type: MigrationType,
    /// Ids of migrations that must already be applied.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Ids of migrations this one is known to conflict with (advisory).
    #[serde(default)]
    pub conflicts: Vec<String>,
    /// Apply sequence.
    pub up: Vec<MigrationStep>,
    /// Revert sequence.
    #[serde(default)]
    pub down: Vec<MigrationStep>,
    /// Assessed risk.
    #[serde(default)]
    pub risk_level: RiskLevel,
    /// A backup must exist before any step runs.
    #[serde(default)]
    pub requires_backup: bool,
    /// Engines this migration targets; empty means all.
    #[serde(default)]
    pub database_engines: Vec<DatabaseEngine>,
    /// Estimated duration in seconds.
    #[serde(default)]
    pub estimated_duration: u64,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl PortableMigration {
    /// Create a migration builder.
    #[must_use]
    pub fn builder(
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        version: impl Into<String>,
    ) -> PortableMigrationBuilder {
        PortableMigrationBuilder::new(id, plugin_id, version)
    }

    /// Steps for a direction.
    #[must_use]
    pub fn steps(&self, direction: Direction) -> &[MigrationStep] {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }

    /// Whether the migration targets `engine`.
    #[must_use]
    pub fn supports_engine(&self, engine: DatabaseEngine) -> bool {
        self.database_engines.is_empty() || self.database_engines.contains(&engine)
    }

    /// Whether every up-step declares rollback support and a down sequence exists.
    #[must_use]
    pub fn can_rollback(&self) -> bool {
        !self.down.is_empty() && self.up.iter().all(|s| s.rollback_supported)
    }

    /// Parsed semantic version.
    pub fn semver(&self) -> Result<semver::Version> {
        parse_version(&self.version)
    }

    /// Content checksum over the fields that define behavior.
    ///
    /// Timestamps and descriptive text are excluded so re-serializing a
    /// migration never changes its identity.
    #[must_use]
    pub fn checksum(&self) -> String {
        checksum::canonical_hash(&serde_json::json!({
            "id": self.id,
            "pluginId": self.plugin_id,
            "version": self.version,
            "dependencies": self.dependencies,
            "up": self.up,
            "down": self.down,
        }))
    }
}

impl fmt::Display for PortableMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} v{})", self.id, self.plugin_id, self.version)
    }
}

/// Parse a semantic version, mapping failures to [`MigrationError::InvalidVersion`].
pub fn parse_version(version: &str) -> Result<semver::Version> {
    semver::Version::parse(version.trim()).map_err(|e| MigrationError::InvalidVersion {
        version: version.to_string(),
        reason: e.to_string(),
    })
}

/// Builder for portable migrations.
#[derive(Debug)]
pub struct PortableMigrationBuilder {
    migration: PortableMigration,
}

impl PortableMigrationBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        plugin_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        let id = id.into();
        Self {
            migration: PortableMigration {
                name: id.clone(),
                id,
                plugin_id: plugin_id.into(),
                description: String::new(),
                version: version.into(),
                migration_type: MigrationType::Schema,
                dependencies: Vec::new(),
                conflicts: Vec::new(),
                up: Vec::new(),
                down: Vec::new(),
                risk_level: RiskLevel::Low,
                requires_backup: false,
                database_engines: Vec::new(),
                estimated_duration: 0,
                created_at: now,
                updated_at: now,
            },
        }
    }

    /// Set the name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.migration.name = name.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.migration.description = description.into();
        self
    }

    /// Set the migration type.
    #[must_use]
    pub fn migration_type(mut self, migration_type: MigrationType) -> Self {
        self.migration.migration_type = migration_type;
        self
    }

    /// Add a dependency.
    #[must_use]
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.migration.dependencies.push(id.into());
        self
    }

    /// Add an advisory conflict.
    #[must_use]
    pub fn conflicts_with(mut self, id: impl Into<String>) -> Self {
        self.migration.conflicts.push(id.into());
        self
    }

    /// Append an up step.
    #[must_use]
    pub fn up(mut self, step: MigrationStep) -> Self {
        self.migration.up.push(step);
        self
    }

    /// Append a down step.
    #[must_use]
    pub fn down(mut self, step: MigrationStep) -> Self {
        self.migration.down.push(step);
        self
    }

    /// Set the risk level.
    #[must_use]
    pub fn risk_level(mut self, risk: RiskLevel) -> Self {
        self.migration.risk_level = risk;
        self
    }

    /// Require a backup before execution.
    #[must_use]
    pub fn requires_backup(mut self, required: bool) -> Self {
        self.migration.requires_backup = required;
        self
    }

    /// Restrict the target engines.
    #[must_use]
    pub fn engines(mut self, engines: impl IntoIterator<Item = DatabaseEngine>) -> Self {
        self.migration.database_engines = engines.into_iter().collect();
        self
    }

    /// Set the estimated duration in seconds.
    #[must_use]
    pub fn estimated_duration(mut self, seconds: u64) -> Self {
        self.migration.estimated_duration = seconds;
        self
    }

    /// Override both timestamps.
    #[must_use]
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.migration.created_at = at;
        self.migration.updated_at = at;
        self
    }

    /// Build the migration.
    pub fn build(self) -> Result<PortableMigration> {
        if self.migration.up.is_empty() {
            return Err(MigrationError::InvalidMigration(format!(
                "{} has no up steps",
                self.migration.id
            )));
        }
        Ok(self.migration)
    }
}
