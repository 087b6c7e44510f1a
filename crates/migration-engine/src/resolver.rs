//! Dependency ordering and conflict detection.

use crate::adapter::FormatAdapter;
use crate::classify::{IndexOperation, TableOperation};
use crate::error::{MigrationError, Result};
use crate::model::{ConflictSeverity, ConflictType, Direction, MigrationConflict, PortableMigration};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Table and index operations of already-applied migrations.
///
/// Used for drift detection: a new migration is compared against what applied
/// migrations did to the same objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppliedState {
    /// Ids of successfully applied migrations.
    pub applied_ids: BTreeSet<String>,
    tables: BTreeMap<String, (String, TableOperation)>,
    indexes: BTreeMap<String, (String, IndexOperation)>,
}

impl AppliedState {
    /// Empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an applied migration. Later records win per object.
    pub fn record(&mut self, migration: &PortableMigration, adapter: &FormatAdapter) {
        let classification = adapter.classifier().classify_steps(&migration.up);
        for (table, op) in classification.tables {
            self.tables.insert(table, (migration.id.clone(), op));
        }
        for (index, op) in classification.indexes {
            self.indexes.insert(index, (migration.id.clone(), op));
        }
        self.applied_ids.insert(migration.id.clone());
    }

    /// Mark an id as applied without knowing its content.
    pub fn mark_applied(&mut self, id: impl Into<String>) {
        self.applied_ids.insert(id.into());
    }

    /// Whether `id` is applied.
    #[must_use]
    pub fn is_applied(&self, id: &str) -> bool {
        self.applied_ids.contains(id)
    }

    /// Last recorded operation on a table.
    #[must_use]
    pub fn table_operation(&self, table: &str) -> Option<&(String, TableOperation)> {
        self.tables.get(table)
    }
}

/// Topological sort with no pre-applied migrations.
///
/// Every dependency must be inside `migrations`.
pub fn resolve_dependencies(migrations: Vec<PortableMigration>) -> Result<Vec<PortableMigration>> {
    resolve_with_applied(migrations, &BTreeSet::new())
}

/// Topological sort where ids in `applied` count as already satisfied.
///
/// Each pass walks the remaining migrations in input order and moves every
/// migration whose dependencies are satisfied, so ties keep input order. A pass
/// that moves nothing means a cycle or a missing dependency.
pub fn resolve_with_applied(
    migrations: Vec<PortableMigration>,
    applied: &BTreeSet<String>,
) -> Result<Vec<PortableMigration>> {
    let mut satisfied: HashSet<String> = applied.iter().cloned().collect();
    let mut resolved = Vec::with_capacity(migrations.len());
    let mut remaining = migrations;

    while !remaining.is_empty() {
        let before = remaining.len();
        let mut blocked = Vec::new();

        for migration in remaining {
            if migration.dependencies.iter().all(|d| satisfied.contains(d)) {
                satisfied.insert(migration.id.clone());
                resolved.push(migration);
            } else {
                blocked.push(migration);
            }
        }

        if blocked.len() == before {
            let unresolved = blocked.iter().map(|m| m.id.clone()).collect();
            return Err(MigrationError::UnresolvedDependencies { unresolved });
        }
        remaining = blocked;
    }

    Ok(resolved)
}

/// Detects conflicts between migrations and against applied state.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    adapter: FormatAdapter,
}

impl DependencyResolver {
    /// Create a resolver using `adapter` for SQL classification.
    #[must_use]
    pub fn new(adapter: FormatAdapter) -> Self {
        Self { adapter }
    }

    /// Conflicts between `migration` and what is already applied.
    ///
    /// Reports table drift (an applied migration left the table in a
    /// different state), index drift, missing dependencies for `up` runs and
    /// declared conflicts that are applied. Records of `migration` itself are
    /// ignored.
    #[must_use]
    pub fn detect_conflicts(
        &self,
        migration: &PortableMigration,
        applied: &AppliedState,
        direction: Direction,
    ) -> Vec<MigrationConflict> {
        let mut conflicts = Vec::new();
        let classification = self.adapter.classifier().classify_steps(&migration.up);

        for (table, op) in &classification.tables {
            let Some((owner, existing)) = applied.tables.get(table) else {
                continue;
            };
            if owner == &migration.id {
                continue;
            }
            let (conflict_type, severity) = if existing == op {
                if *op != TableOperation::Create {
                    continue;
                }
                (ConflictType::Naming, ConflictSeverity::High)
            } else if op.is_destructive() || existing.is_destructive() {
                (ConflictType::Table, ConflictSeverity::Critical)
            } else {
                (ConflictType::Table, ConflictSeverity::High)
            };
            conflicts.push(MigrationConflict {
                conflict_type,
                migration_a: migration.id.clone(),
                migration_b: owner.clone(),
                object_name: table.clone(),
                description: format!("{op} TABLE '{table}' after {owner} ran {existing} TABLE"),
                severity,
                auto_resolvable: false,
            });
        }

        for (index, op) in &classification.indexes {
            let Some((owner, existing)) = applied.indexes.get(index) else {
                continue;
            };
            if owner == &migration.id || existing == op {
                continue;
            }
            conflicts.push(MigrationConflict {
                conflict_type: ConflictType::Index,
                migration_a: migration.id.clone(),
                migration_b: owner.clone(),
                object_name: index.clone(),
                description: format!("{op} INDEX '{index}' after {owner} ran {existing} INDEX"),
                severity: ConflictSeverity::Medium,
                auto_resolvable: true,
            });
        }

        if direction == Direction::Up {
            for dependency in &migration.dependencies {
                if !applied.is_applied(dependency) {
                    conflicts.push(MigrationConflict {
                        conflict_type: ConflictType::Dependency,
                        migration_a: migration.id.clone(),
                        migration_b: dependency.clone(),
                        object_name: dependency.clone(),
                        description: format!("dependency {dependency} is not applied"),
                        severity: ConflictSeverity::Critical,
                        auto_resolvable: false,
                    });
                }
            }
        }

        for declared in &migration.conflicts {
            if applied.is_applied(declared) {
                conflicts.push(MigrationConflict {
                    conflict_type: ConflictType::Dependency,
                    migration_a: migration.id.clone(),
                    migration_b: declared.clone(),
                    object_name: declared.clone(),
                    description: format!("declared conflict {declared} is applied"),
                    severity: ConflictSeverity::High,
                    auto_resolvable: false,
                });
            }
        }

        conflicts
    }

    /// Pairwise conflicts across every pair of `migrations`.
    #[must_use]
    pub fn detect_multiple_conflicts(&self, migrations: &[PortableMigration]) -> Vec<MigrationConflict> {
        let mut conflicts = Vec::new();
        for (i, a) in migrations.iter().enumerate() {
            for b in &migrations[i + 1..] {
                conflicts.extend(self.adapter.detect_conflicts(a, b));
            }
        }
        conflicts
    }
}
