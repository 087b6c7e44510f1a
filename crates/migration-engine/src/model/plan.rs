//! Conflicts, validation reports and migration plans.

use super::migration::{PortableMigration, RiskLevel};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// What kind of object two migrations disagree about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Same table, different operations.
    Table,
    /// Same column.
    Column,
    /// Same index, different operations.
    Index,
    /// Same constraint.
    Constraint,
    /// Same function.
    Function,
    /// Name collision.
    Naming,
    /// Missing or declared-conflicting dependency.
    Dependency,
    /// Version ordering.
    Version,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Table => "table",
            Self::Column => "column",
            Self::Index => "index",
            Self::Constraint => "constraint",
            Self::Function => "function",
            Self::Naming => "naming",
            Self::Dependency => "dependency",
            Self::Version => "version",
        };
        f.write_str(s)
    }
}

/// Conflict severity, ordered `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictSeverity {
    /// Informational.
    Low,
    /// Worth a look.
    Medium,
    /// Likely to break.
    High,
    /// Blocks execution unless forced.
    Critical,
}

impl fmt::Display for ConflictSeverity {
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

/// A detected incompatibility between two migrations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationConflict {
    /// Conflict kind.
    #[serde(rename = "type")]
    pub conflict_type: ConflictType,
    /// First migration.
    pub migration_a: String,
    /// Second migration.
    pub migration_b: String,
    /// Object both migrations touch.
    pub object_name: String,
    /// Description.
    pub description: String,
    /// Severity.
    pub severity: ConflictSeverity,
    /// Can be resolved without operator input.
    pub auto_resolvable: bool,
}

impl MigrationConflict {
    /// Whether this conflict blocks an unforced run.
    #[must_use]
    pub fn is_critical(&self) -> bool {
        self.severity == ConflictSeverity::Critical
    }
}

impl fmt::Display for MigrationConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} conflict on '{}' between {} and {}: {}",
            self.severity,
            self.conflict_type,
            self.object_name,
            self.migration_a,
            self.migration_b,
            self.description
        )
    }
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationIssue {
    /// Machine-readable code, e.g. `DANGEROUS_SQL`.
    pub code: String,
    /// Message.
    pub message: String,
    /// Migration the finding belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub migration_id: Option<String>,
    /// Step the finding belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
}

impl ValidationIssue {
    /// Create a finding.
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            migration_id: None,
            step_id: None,
        }
    }

    /// Attach a migration id.
    #[must_use]
    pub fn in_migration(mut self, id: impl Into<String>) -> Self {
        self.migration_id = Some(id.into());
        self
    }

    /// Attach a step id.
    #[must_use]
    pub fn at_step(mut self, id: impl Into<String>) -> Self {
        self.step_id = Some(id.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(step) = &self.step_id {
            write!(f, " (step {step})")?;
        }
        Ok(())
    }
}

/// Validation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MigrationValidation {
    /// No errors were found.
    pub valid: bool,
    /// Blocking findings.
    pub errors: Vec<ValidationIssue>,
    /// Non-blocking findings.
    pub warnings: Vec<ValidationIssue>,
}

impl MigrationValidation {
    /// A report with no findings.
    #[must_use]
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Add an error.
    pub fn error(&mut self, issue: ValidationIssue) {
        self.valid = false;
        self.errors.push(issue);
    }

    /// Add a warning.
    pub fn warn(&mut self, issue: ValidationIssue) {
        self.warnings.push(issue);
    }

    /// Fold another report into this one.
    pub fn merge(&mut self, other: Self) {
        self.valid = self.valid && other.valid;
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }

    /// Error messages as plain strings.
    #[must_use]
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

/// One entry of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlannedMigration {
    /// 1-based execution order.
    pub order: usize,
    /// Migration.
    pub migration: PortableMigration,
}

/// Ordered, validated sequence bringing a plugin to a target version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationPlan {
    /// Plugin id.
    pub plugin_id: String,
    /// Version before the plan runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    /// Version after the plan runs.
    pub target_version: String,
    /// Migrations in execution order.
    pub migrations: Vec<PlannedMigration>,
    /// Sum of estimated durations, in seconds.
    pub estimated_duration: u64,
    /// Highest risk across the migrations.
    pub estimated_risk: RiskLevel,
    /// Any migration requires a backup.
    pub requires_backup: bool,
    /// Every up-step of every migration supports rollback.
    pub can_rollback: bool,
    /// Conflicts between planned and applied migrations.
    pub conflicts: Vec<MigrationConflict>,
    /// Validation report.
    pub validation: MigrationValidation,
    /// When the plan was computed.
    pub created_at: DateTime<Utc>,
}

impl MigrationPlan {
    /// Assemble a plan from already-ordered migrations.
    #[must_use]
    pub fn from_ordered(
        plugin_id: impl Into<String>,
        current_version: Option<String>,
        target_version: impl Into<String>,
        ordered: Vec<PortableMigration>,
        conflicts: Vec<MigrationConflict>,
        validation: MigrationValidation,
    ) -> Self {
        let estimated_duration = ordered.iter().map(|m| m.estimated_duration).sum();
        let estimated_risk = ordered
            .iter()
            .map(|m| m.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);
        let requires_backup = ordered.iter().any(|m| m.requires_backup);
        let can_rollback = ordered
            .iter()
            .all(|m| m.up.iter().all(|s| s.rollback_supported));

        Self {
            plugin_id: plugin_id.into(),
            current_version,
            target_version: target_version.into(),
            migrations: ordered
                .into_iter()
                .enumerate()
                .map(|(i, migration)| PlannedMigration {
                    order: i + 1,
                    migration,
                })
                .collect(),
            estimated_duration,
            estimated_risk,
            requires_backup,
            can_rollback,
            conflicts,
            validation,
            created_at: Utc::now(),
        }
    }

    /// Migration ids in execution order.
    #[must_use]
    pub fn migration_ids(&self) -> Vec<&str> {
        self.migrations.iter().map(|p| p.migration.id.as_str()).collect()
    }

    /// Whether the plan has nothing to do.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}
