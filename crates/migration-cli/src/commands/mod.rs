//! CLI commands module.

use anyhow::{Context, Result};
use colored::Colorize;
use migration_engine::{FormatAdapter, MigrationResult, PortableMigration, StepStatus};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tabled::Tabled;

use crate::output::{self, CommandResult, OutputFormat};

pub mod convert;
pub mod plan;
pub mod render;
pub mod rollback;
pub mod run;
pub mod status;
pub mod transfer;
pub mod validate;

/// Read a migration envelope from disk.
pub fn read_migration(path: &Path, adapter: &FormatAdapter) -> Result<PortableMigration> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    adapter
        .from_json(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))
}

/// Write `content` to `output`, or print it to stdout when no path is given.
pub fn write_or_print(output: Option<&PathBuf>, content: &str) -> Result<()> {
    match output {
        Some(path) => std::fs::write(path, content)
            .with_context(|| format!("Failed to write {}", path.display())),
        None => {
            println!("{content}");
            Ok(())
        }
    }
}

/// One step line of a run summary.
#[derive(Debug, Tabled)]
struct StepRow {
    #[tabled(rename = "#")]
    order: usize,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Rows")]
    rows: u64,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// JSON payload of `run` and `rollback`.
#[derive(Debug, Serialize)]
struct RunOutput<'a> {
    result: &'a MigrationResult,
}

/// Print a migration result. Fails when the run was unsuccessful so the
/// process exits non-zero.
pub fn print_result(result: &MigrationResult, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let error = result
                .errors
                .first()
                .map(|e| format!("{}: {}", e.code, e.message));
            CommandResult::outcome(result.success, RunOutput { result }, error).print(format)?;
        }
        OutputFormat::Text => {
            let title = format!(
                "Migration {} ({}{})",
                result.migration_id,
                result.direction,
                if result.metadata.dry_run { ", dry run" } else { "" }
            );
            output::section(&title);
            output::key_value("Plugin", &result.plugin_id);
            output::key_value("Session", &result.session_id);
            output::key_value(
                "Steps",
                &format!(
                    "{} total, {} succeeded, {} failed, {} skipped",
                    result.total_steps,
                    result.successful_steps,
                    result.failed_steps,
                    result.skipped_steps
                ),
            );
            output::key_value("Duration", &output::format_millis(result.duration_ms));
            if let Some(location) = &result.backup_location {
                output::key_value("Backup", location);
            }

            let rows: Vec<StepRow> = result
                .steps
                .iter()
                .map(|s| StepRow {
                    order: s.order_index + 1,
                    step: s.step_id.clone(),
                    status: match s.status {
                        StepStatus::Success => "success".green().to_string(),
                        StepStatus::Failed => "failed".red().to_string(),
                        StepStatus::Skipped => "skipped".yellow().to_string(),
                    },
                    rows: s.rows_affected,
                    duration: output::format_millis(s.duration_ms),
                    error: s.error.clone().unwrap_or_default(),
                })
                .collect();
            println!();
            output::table(&rows);

            for warning in &result.warnings {
                output::warning(warning);
            }
            for error in &result.errors {
                output::error(&format!("{}: {}", error.code, error.message));
            }
            if result.success {
                output::success("Migration completed");
            }
        }
    }

    if result.success {
        Ok(())
    } else {
        anyhow::bail!("Migration {} did not complete", result.migration_id)
    }
}
