//! Rollback command - revert a previously applied migration.

use anyhow::{Context, Result};
use clap::Args;
use migration_engine::{ExecutionOptions, MigrationExecutionContext};
use std::path::PathBuf;

use crate::cli::GlobalArgs;

/// Arguments for the rollback command.
#[derive(Args, Debug)]
pub struct RollbackArgs {
    /// Migration id to roll back
    pub id: String,

    /// Envelope to register first when the catalog does not hold the migration
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Record the rollback without executing SQL
    #[arg(long)]
    pub dry_run: bool,

    /// Proceed despite critical conflicts
    #[arg(long)]
    pub force: bool,

    /// Do not create a backup even if the migration requires one
    #[arg(long)]
    pub skip_backup: bool,
}

/// Execute the rollback command.
pub async fn execute(args: RollbackArgs, global: &GlobalArgs) -> Result<()> {
    let engine = global.connect().await?;

    if let Some(file) = &args.file {
        let migration = super::read_migration(file, engine.adapter())?;
        anyhow::ensure!(
            migration.id == args.id,
            "{} holds migration {}, not {}",
            file.display(),
            migration.id,
            args.id
        );
        engine
            .catalog()
            .register(&migration)
            .await
            .context("Failed to register migration")?;
    }

    let context = MigrationExecutionContext::new(engine.database_engine())
        .dry_run(args.dry_run)
        .force(args.force)
        .options(ExecutionOptions {
            skip_backup: args.skip_backup,
            ..ExecutionOptions::default()
        });

    let result = engine
        .rollback_migration(&args.id, &context)
        .await
        .map_err(|e| anyhow::anyhow!("Rollback of {} rejected: {}", args.id, e))?;

    super::print_result(&result, global.format())
}
