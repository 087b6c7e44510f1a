//! Render command - produce a standalone SQL file from an envelope.

use anyhow::Result;
use clap::Args;
use migration_engine::{DatabaseEngine, Direction, FormatAdapter};
use std::path::PathBuf;

use crate::cli::GlobalArgs;
use crate::output;

/// Arguments for the render command.
#[derive(Args, Debug)]
pub struct RenderArgs {
    /// Migration envelope (JSON)
    pub file: PathBuf,

    /// Target engine
    #[arg(long, default_value = "postgresql")]
    pub engine: DatabaseEngine,

    /// Steps to render (up or down)
    #[arg(long, default_value = "up")]
    pub direction: Direction,

    /// Write the SQL here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Execute the render command.
pub async fn execute(args: RenderArgs, _global: &GlobalArgs) -> Result<()> {
    let adapter = FormatAdapter::default();
    let migration = super::read_migration(&args.file, &adapter)?;

    if migration.steps(args.direction).is_empty() {
        anyhow::bail!("{} has no {} steps", migration.id, args.direction);
    }
    if !migration.supports_engine(args.engine) {
        output::warning(&format!(
            "{} does not declare support for {}",
            migration.id, args.engine
        ));
    }

    let sql = adapter.to_sql_file(&migration, args.engine, args.direction);
    super::write_or_print(args.output.as_ref(), &sql)?;
    if let Some(path) = &args.output {
        output::success(&format!("Rendered {} -> {}", migration.id, path.display()));
    }
    Ok(())
}
