//! Structural and heuristic validation.

use crate::classify::dangerous_statements;
use crate::config::DatabaseEngine;
use crate::expression::Expression;
use crate::model::{
    DataTransform, FieldTransform, MigrationStep, MigrationValidation, PortableMigration,
    StepAction, ValidationIssue,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Duration;

/// Validates migrations and plans.
#[derive(Debug, Clone)]
pub struct MigrationValidator {
    performance_warning_threshold: Duration,
}

impl Default for MigrationValidator {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl MigrationValidator {
    /// Create a validator. Estimated durations above `threshold` produce a warning.
    #[must_use]
    pub fn new(performance_warning_threshold: Duration) -> Self {
        Self {
            performance_warning_threshold,
        }
    }

    /// Validate one migration for execution on `engine`.
    #[must_use]
    pub fn validate_migration(
        &self,
        migration: &PortableMigration,
        engine: DatabaseEngine,
    ) -> MigrationValidation {
        let mut report = MigrationValidation::ok();
        let id = migration.id.as_str();
        let issue = |code: &str, message: String| ValidationIssue::new(code, message).in_migration(id);

        if migration.id.trim().is_empty() {
            report.error(issue("EMPTY_ID", "migration id is empty".to_string()));
        }
        if migration.plugin_id.trim().is_empty() {
            report.error(issue("EMPTY_PLUGIN_ID", "plugin id is empty".to_string()));
        }
        if migration.version.trim().is_empty() {
            report.error(issue("EMPTY_VERSION", "version is empty".to_string()));
        } else if let Err(e) = migration.semver() {
            report.warn(issue("INVALID_VERSION", e.to_string()));
        }
        if migration.up.is_empty() {
            report.error(issue("NO_UP_STEPS", "migration has no up steps".to_string()));
        }
        if !migration.supports_engine(engine) {
            report.warn(issue(
                "ENGINE_NOT_TARGETED",
                format!("migration does not list {engine} as a target engine"),
            ));
        }

        for steps in [&migration.up, &migration.down] {
            self.validate_steps(id, steps, engine, &mut report);
        }

        if migration.down.is_empty() && migration.up.iter().any(|s| s.rollback_supported) {
            report.error(issue(
                "INVALID_ROLLBACK",
                "steps declare rollback support but the down sequence is empty".to_string(),
            ));
        }

        if Duration::from_secs(migration.estimated_duration) > self.performance_warning_threshold {
            report.warn(issue(
                "PERFORMANCE",
                format!(
                    "estimated duration {}s exceeds {}s",
                    migration.estimated_duration,
                    self.performance_warning_threshold.as_secs()
                ),
            ));
        }

        report
    }

    fn validate_steps(
        &self,
        migration_id: &str,
        steps: &[MigrationStep],
        engine: DatabaseEngine,
        report: &mut MigrationValidation,
    ) {
        let mut seen: HashSet<&str> = HashSet::new();
        let all_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

        for step in steps {
            let issue = |code: &str, message: String| {
                ValidationIssue::new(code, message)
                    .in_migration(migration_id)
                    .at_step(&step.id)
            };

            if step.id.trim().is_empty() {
                report.error(issue("EMPTY_STEP_ID", "step id is empty".to_string()));
            } else if !seen.insert(step.id.as_str()) {
                report.error(issue("DUPLICATE_STEP_ID", format!("step id '{}' is repeated", step.id)));
            }

            for dependency in &step.dependencies {
                if !all_ids.contains(dependency.as_str()) {
                    report.warn(issue(
                        "UNKNOWN_STEP_DEPENDENCY",
                        format!("depends on unknown step '{dependency}'"),
                    ));
                } else if !seen.contains(dependency.as_str()) {
                    report.warn(issue(
                        "STEP_ORDER",
                        format!("depends on later step '{dependency}'; steps run in array order"),
                    ));
                }
            }

            match &step.action {
                StepAction::Sql(sql) => {
                    let any_text = !sql.universal.trim().is_empty()
                        || DatabaseEngine::ALL
                            .iter()
                            .any(|e| sql.has_variant(*e) && !sql.for_engine(*e).trim().is_empty());
                    if !any_text {
                        report.error(issue("EMPTY_SQL", "step has no SQL for any engine".to_string()));
                    }
                    for finding in dangerous_statements(sql.for_engine(engine)) {
                        report.error(issue("DANGEROUS_SQL", format!("{finding} is not allowed")));
                    }
                }
                StepAction::Transform(transform) => {
                    for message in transform_problems(transform) {
                        report.error(issue("INVALID_TRANSFORM", message));
                    }
                }
            }
        }
    }

    /// Validate an ordered plan.
    ///
    /// Checks that every dependency is either applied or planned earlier,
    /// that ids are unique, and that the planned dependency graph is acyclic.
    #[must_use]
    pub fn validate_migration_plan(
        &self,
        ordered: &[PortableMigration],
        applied: &BTreeSet<String>,
    ) -> MigrationValidation {
        let mut report = MigrationValidation::ok();
        let position: HashMap<&str, usize> = ordered
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.as_str(), i))
            .collect();

        let mut seen = HashSet::new();
        for (i, migration) in ordered.iter().enumerate() {
            if !seen.insert(migration.id.as_str()) {
                report.error(
                    ValidationIssue::new("DUPLICATE_MIGRATION", format!("{} is planned twice", migration.id))
                        .in_migration(&migration.id),
                );
            }
            for dependency in &migration.dependencies {
                match position.get(dependency.as_str()) {
                    Some(&p) if p > i => report.error(
                        ValidationIssue::new(
                            "ORDER_VIOLATION",
                            format!("{} is planned before its dependency {dependency}", migration.id),
                        )
                        .in_migration(&migration.id),
                    ),
                    Some(_) => {}
                    None if applied.contains(dependency) => {}
                    None => report.error(
                        ValidationIssue::new(
                            "MISSING_DEPENDENCY",
                            format!("{} depends on {dependency}, which is neither applied nor planned", migration.id),
                        )
                        .in_migration(&migration.id),
                    ),
                }
            }
        }

        for cycle in find_cycles(ordered) {
            report.error(ValidationIssue::new(
                "CIRCULAR_DEPENDENCY",
                format!("circular dependency: {}", cycle.join(" -> ")),
            ));
        }

        report
    }
}

fn transform_problems(transform: &DataTransform) -> Vec<String> {
    let mut problems = Vec::new();
    if transform.source_table.trim().is_empty() {
        problems.push("source table is empty".to_string());
    }
    if transform.target_table.trim().is_empty() {
        problems.push("target table is empty".to_string());
    }
    if transform.mapping.is_empty() {
        problems.push("mapping is empty".to_string());
    }
    if transform.batch_size == Some(0) {
        problems.push("batch size must be greater than 0".to_string());
    }
    for mapping in &transform.mapping {
        if mapping.target.trim().is_empty() {
            problems.push("mapping target is empty".to_string());
        }
        match &mapping.transform {
            FieldTransform::Direct if mapping.source.as_deref().map_or(true, str::is_empty) => {
                problems.push(format!("direct mapping to '{}' has no source", mapping.target));
            }
            FieldTransform::Expression { expr } => {
                if let Err(e) = Expression::parse(expr) {
                    problems.push(format!("expression for '{}': {e}", mapping.target));
                }
            }
            _ => {}
        }
    }
    problems
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

// Cycles among planned migrations, each reported once, starting from the
// node that closes it.
fn find_cycles(migrations: &[PortableMigration]) -> Vec<Vec<String>> {
    let graph: HashMap<&str, Vec<&str>> = migrations
        .iter()
        .map(|m| (m.id.as_str(), m.dependencies.iter().map(String::as_str).collect()))
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut stack: Vec<&str> = Vec::new();
    let mut cycles = Vec::new();
    let mut reported: HashSet<BTreeSet<String>> = HashSet::new();

    fn visit<'a>(
        node: &'a str,
        graph: &HashMap<&'a str, Vec<&'a str>>,
        marks: &mut HashMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        cycles: &mut Vec<Vec<String>>,
        reported: &mut HashSet<BTreeSet<String>>,
    ) {
        marks.insert(node, Mark::Visiting);
        stack.push(node);
        for &next in graph.get(node).into_iter().flatten() {
            if !graph.contains_key(next) {
                continue;
            }
            match marks.get(next) {
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(ToString::to_string).collect();
                    let members: BTreeSet<String> = cycle.iter().cloned().collect();
                    if reported.insert(members) {
                        cycle.push(next.to_string());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(next, graph, marks, stack, cycles, reported),
            }
        }
        stack.pop();
        marks.insert(node, Mark::Done);
    }

    for migration in migrations {
        let id = migration.id.as_str();
        if !marks.contains_key(id) {
            visit(id, &graph, &mut marks, &mut stack, &mut cycles, &mut reported);
        }
    }
    cycles
}
