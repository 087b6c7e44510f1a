//! Data contracts shared by every component.

mod execution;
mod migration;
mod plan;
mod transfer;

pub use execution::{
    ChangeSummary, ErrorCode, ExecutionError, ExecutionMetadata, ExecutionOptions,
    MigrationExecutionContext, MigrationResult, StepResult, StepStatus,
};
pub use migration::{
    parse_version, DataTransform, Direction, Expectation, FieldMapping, FieldTransform,
    MigrationStep, MigrationType, PortableMigration, PortableMigrationBuilder, RiskLevel,
    StepAction, StepSql, StepValidation, ValidationCheck,
};
pub use plan::{
    ConflictSeverity, ConflictType, MigrationConflict, MigrationPlan, MigrationValidation,
    PlannedMigration, ValidationIssue,
};
pub use transfer::{
    ColumnSchema, DataExport, DataImport, ImportOptions, ImportResult, RecordError, TableSchema,
};
