//! Convert command - wrap a legacy SQL migration into an envelope.

use anyhow::{Context, Result};
use clap::Args;
use migration_engine::{DatabaseEngine, FormatAdapter, RawMigration};
use std::path::PathBuf;

use crate::cli::GlobalArgs;
use crate::output::{self, CommandResult, OutputFormat};

const UP_MARKER: &str = "-- +up";
const DOWN_MARKER: &str = "-- +down";

/// Arguments for the convert command.
#[derive(Args, Debug)]
pub struct ConvertArgs {
    /// Legacy migration: a `.sql` file with `-- +up`/`-- +down` sections, or a JSON object
    pub file: PathBuf,

    /// Owning plugin id
    #[arg(long)]
    pub plugin: String,

    /// Migration version (required for `.sql` input)
    #[arg(long)]
    pub version: Option<String>,

    /// Migration name (defaults to the file stem)
    #[arg(long)]
    pub name: Option<String>,

    /// Engines to generate SQL variants for
    #[arg(long, value_delimiter = ',', default_values_t = DatabaseEngine::ALL)]
    pub engines: Vec<DatabaseEngine>,

    /// Write the envelope here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Split a `.sql` source into up and optional down SQL.
///
/// Without markers the whole file is the up SQL.
fn parse_sql_source(source: &str) -> (String, Option<String>) {
    let mut up = String::new();
    let mut down = String::new();
    let mut in_down = false;
    let mut marked = false;

    for line in source.lines() {
        let trimmed = line.trim();
        if trimmed.eq_ignore_ascii_case(UP_MARKER) {
            in_down = false;
            marked = true;
            continue;
        }
        if trimmed.eq_ignore_ascii_case(DOWN_MARKER) {
            in_down = true;
            marked = true;
            continue;
        }
        let target = if in_down { &mut down } else { &mut up };
        target.push_str(line);
        target.push('\n');
    }

    if !marked {
        return (source.trim().to_string(), None);
    }
    let down = down.trim();
    (
        up.trim().to_string(),
        (!down.is_empty()).then(|| down.to_string()),
    )
}

impl ConvertArgs {
    fn raw_migration(&self, source: &str) -> Result<RawMigration> {
        let is_json = self
            .file
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("json"));

        let mut raw = if is_json {
            serde_json::from_str::<RawMigration>(source)
                .with_context(|| format!("Failed to parse {}", self.file.display()))?
        } else {
            let (up, down) = parse_sql_source(source);
            let version = self
                .version
                .clone()
                .context("--version is required for SQL input")?;
            RawMigration {
                version,
                up,
                down,
                ..RawMigration::default()
            }
        };

        if let Some(version) = &self.version {
            raw.version.clone_from(version);
        }
        if let Some(name) = &self.name {
            raw.name.clone_from(name);
        }
        if raw.name.is_empty() {
            raw.name = self
                .file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("migration")
                .to_string();
        }
        Ok(raw)
    }
}

/// Execute the convert command.
pub async fn execute(args: ConvertArgs, global: &GlobalArgs) -> Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("Failed to read {}", args.file.display()))?;
    let raw = args.raw_migration(&source)?;

    let adapter = FormatAdapter::default();
    let migration = adapter
        .to_portable(raw, &args.plugin, &args.engines)
        .context("Conversion failed")?;
    let json = adapter.to_json(&migration)?;

    let format = global.format();
    match (&args.output, format) {
        (Some(path), OutputFormat::Json) => {
            super::write_or_print(Some(path), &json)?;
            CommandResult::success_message(format!("Wrote {}", path.display())).print(format)?;
        }
        (Some(path), OutputFormat::Text) => {
            super::write_or_print(Some(path), &json)?;
            output::success(&format!("Converted {} -> {}", migration.id, path.display()));
            output::key_value("Type", &migration.migration_type.to_string());
            output::key_value("Risk", &migration.risk_level.to_string());
            output::key_value("Requires backup", &migration.requires_backup.to_string());
            output::key_value("Reversible", &migration.can_rollback().to_string());
        }
        (None, _) => super::write_or_print(None, &json)?,
    }

    Ok(())
}
