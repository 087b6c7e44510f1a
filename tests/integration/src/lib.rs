//! Integration tests for the plugin migration engine
//!
//! Every test runs the engine against a real SQLite database in a temporary
//! directory:
//! - Execution, dry runs and rollback
//! - Planning across several migrations of one plugin
//! - Export and import of plugin data

pub mod fixtures;
pub mod helpers;

// Re-export commonly used items
pub use fixtures::*;
pub use helpers::*;

#[cfg(test)]
mod execution_tests;
#[cfg(test)]
mod planning_tests;
#[cfg(test)]
mod transfer_tests;
