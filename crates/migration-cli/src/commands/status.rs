//! Status command - execution history from the audit log.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use migration_engine::{ExecutionRecord, ExecutionStatus, StepRecord};
use serde::Serialize;
use tabled::Tabled;

use crate::cli::GlobalArgs;
use crate::output::{self, CommandResult, OutputFormat};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only show executions of this plugin
    #[arg(long)]
    pub plugin: Option<String>,

    /// Maximum number of executions to show
    #[arg(long, default_value = "20")]
    pub limit: usize,

    /// Show the steps of one execution
    #[arg(long)]
    pub execution: Option<String>,
}

#[derive(Debug, Tabled)]
struct ExecutionRow {
    #[tabled(rename = "Started")]
    started: String,
    #[tabled(rename = "Migration")]
    migration: String,
    #[tabled(rename = "Dir")]
    direction: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Duration")]
    duration: String,
    #[tabled(rename = "Execution")]
    execution_id: String,
}

impl From<&ExecutionRecord> for ExecutionRow {
    fn from(record: &ExecutionRecord) -> Self {
        let status = match (record.status, record.success) {
            (ExecutionStatus::Completed, true) => "completed".green().to_string(),
            (ExecutionStatus::Running, _) => "running".yellow().to_string(),
            _ => "failed".red().to_string(),
        };
        let migration = if record.dry_run {
            format!("{} (dry run)", record.migration_id)
        } else {
            record.migration_id.clone()
        };
        Self {
            started: output::format_timestamp(record.started_at),
            migration,
            direction: record.direction.to_string(),
            status,
            duration: output::format_millis(record.duration_ms),
            execution_id: record.execution_id.clone(),
        }
    }
}

#[derive(Debug, Tabled)]
struct StepHistoryRow {
    #[tabled(rename = "#")]
    order: usize,
    #[tabled(rename = "Step")]
    step: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Rows")]
    rows: u64,
    #[tabled(rename = "Error")]
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusOutput {
    total: usize,
    executions: Vec<ExecutionRecord>,
}

/// Execute the status command.
pub async fn execute(args: StatusArgs, global: &GlobalArgs) -> Result<()> {
    let engine = global.connect().await?;
    let format = global.format();

    if let Some(execution_id) = &args.execution {
        let steps = engine
            .step_history(execution_id)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get step history: {}", e))?;
        return print_steps(execution_id, &steps, format);
    }

    let mut executions = engine
        .get_migration_status(args.plugin.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get status: {}", e))?;
    let total = executions.len();
    executions.truncate(args.limit);

    match format {
        OutputFormat::Json => {
            CommandResult::success(StatusOutput { total, executions }).print(format)?;
        }
        OutputFormat::Text => {
            output::section("Migration Status");
            if let Some(plugin) = &args.plugin {
                output::key_value("Plugin", plugin);
            }
            output::key_value("Executions", &total.to_string());
            println!();
            let rows: Vec<ExecutionRow> = executions.iter().map(ExecutionRow::from).collect();
            output::table(&rows);
        }
    }

    Ok(())
}

fn print_steps(execution_id: &str, steps: &[StepRecord], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => CommandResult::success(steps).print(format),
        OutputFormat::Text => {
            output::section(&format!("Steps of {execution_id}"));
            let rows: Vec<StepHistoryRow> = steps
                .iter()
                .map(|s| StepHistoryRow {
                    order: s.order_index + 1,
                    step: s.step_id.clone(),
                    status: s.status.to_string(),
                    rows: s.rows_affected,
                    error: s.error.clone().unwrap_or_default(),
                })
                .collect();
            output::table(&rows);
            Ok(())
        }
    }
}
