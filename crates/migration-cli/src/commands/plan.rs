//! Plan command - compute the migrations that bring a plugin to a version.

use anyhow::{Context, Result};
use clap::Args;
use migration_engine::{MigrationExecutionContext, MigrationPlan};
use std::path::{Path, PathBuf};
use tabled::Tabled;

use crate::cli::GlobalArgs;
use crate::output::{self, CommandResult, OutputFormat};

/// Arguments for the plan command.
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Plugin id
    pub plugin: String,

    /// Target version
    pub version: String,

    /// Directory of envelopes to register before planning
    #[arg(long)]
    pub migrations: Option<PathBuf>,
}

#[derive(Debug, Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    order: usize,
    #[tabled(rename = "Migration")]
    id: String,
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Risk")]
    risk: String,
    #[tabled(rename = "Est. (s)")]
    duration: u64,
    #[tabled(rename = "Backup")]
    backup: String,
}

fn envelope_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Execute the plan command.
pub async fn execute(args: PlanArgs, global: &GlobalArgs) -> Result<()> {
    let engine = global.connect().await?;

    if let Some(dir) = &args.migrations {
        for file in envelope_files(dir)? {
            let migration = super::read_migration(&file, engine.adapter())?;
            engine
                .catalog()
                .register(&migration)
                .await
                .with_context(|| format!("Failed to register {}", file.display()))?;
        }
    }

    let context = MigrationExecutionContext::new(engine.database_engine());
    let plan = engine
        .create_migration_plan(&args.plugin, &args.version, &context)
        .await
        .map_err(|e| anyhow::anyhow!("Planning failed: {}", e))?;

    print_plan(&plan, global.format())
}

fn print_plan(plan: &MigrationPlan, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let error = plan.validation.errors.first().map(ToString::to_string);
            CommandResult::outcome(plan.validation.valid, plan, error).print(format)?;
        }
        OutputFormat::Text => {
            output::section(&format!("Plan for {} -> {}", plan.plugin_id, plan.target_version));
            output::key_value(
                "Current version",
                plan.current_version.as_deref().unwrap_or("(none)"),
            );
            output::key_value("Estimated duration", &format!("{}s", plan.estimated_duration));
            output::key_value("Estimated risk", &plan.estimated_risk.to_string());
            output::key_value("Requires backup", &plan.requires_backup.to_string());
            output::key_value("Can roll back", &plan.can_rollback.to_string());

            if plan.is_empty() {
                println!();
                output::info("Nothing to migrate");
            } else {
                let rows: Vec<PlanRow> = plan
                    .migrations
                    .iter()
                    .map(|p| PlanRow {
                        order: p.order,
                        id: p.migration.id.clone(),
                        version: p.migration.version.clone(),
                        risk: p.migration.risk_level.to_string(),
                        duration: p.migration.estimated_duration,
                        backup: if p.migration.requires_backup { "yes" } else { "no" }.to_string(),
                    })
                    .collect();
                println!();
                output::table(&rows);
            }

            for conflict in &plan.conflicts {
                output::warning(&conflict.to_string());
            }
            for warning in &plan.validation.warnings {
                output::warning(&warning.to_string());
            }
            for error in &plan.validation.errors {
                output::error(&error.to_string());
            }
        }
    }

    if plan.validation.valid {
        Ok(())
    } else {
        anyhow::bail!("Plan for {} is not valid", plan.plugin_id)
    }
}
