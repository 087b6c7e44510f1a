//! Validate command - offline checks of a migration envelope.

use anyhow::{Context, Result};
use clap::Args;
use migration_engine::{
    DatabaseEngine, EngineConfig, FormatAdapter, MigrationValidation, MigrationValidator,
};
use serde::Serialize;
use std::path::PathBuf;

use crate::cli::GlobalArgs;
use crate::output::{self, CommandResult, OutputFormat};

/// Arguments for the validate command.
#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Migration envelope (JSON)
    pub file: PathBuf,

    /// Engine to validate against
    #[arg(long, default_value = "postgresql")]
    pub engine: DatabaseEngine,
}

#[derive(Debug, Serialize)]
struct ValidateOutput {
    migration_id: String,
    engine: DatabaseEngine,
    validation: MigrationValidation,
}

/// Execute the validate command.
pub async fn execute(args: ValidateArgs, global: &GlobalArgs) -> Result<()> {
    // Only the warning threshold is read; no connection is made.
    let config = match &global.config {
        Some(path) => EngineConfig::load(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let validator = MigrationValidator::new(config.performance_warning_threshold);
    let migration = super::read_migration(&args.file, &FormatAdapter::default())?;
    let validation = validator.validate_migration(&migration, args.engine);
    let format = global.format();

    match format {
        OutputFormat::Json => {
            let error = validation.errors.first().map(ToString::to_string);
            let valid = validation.valid;
            let data = ValidateOutput {
                migration_id: migration.id.clone(),
                engine: args.engine,
                validation,
            };
            CommandResult::outcome(valid, &data, error).print(format)?;
            if !valid {
                anyhow::bail!("Migration {} is not valid", migration.id);
            }
        }
        OutputFormat::Text => {
            output::section(&format!("Validating {migration}"));
            output::key_value("Engine", &args.engine.to_string());
            output::key_value("Steps", &format!("{} up, {} down", migration.up.len(), migration.down.len()));
            output::status("Valid", validation.valid);
            for warning in &validation.warnings {
                output::warning(&warning.to_string());
            }
            for error in &validation.errors {
                output::error(&error.to_string());
            }
            if !validation.valid {
                anyhow::bail!("Migration {} is not valid", migration.id);
            }
            output::success("Migration is valid");
        }
    }

    Ok(())
}
