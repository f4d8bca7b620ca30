//! Command-line interface for forge-harness.
//!
//! Provides commands for bundle validation, single and batch runs, and
//! trace inspection.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
