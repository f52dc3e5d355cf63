//! Command-line interface for taskforge.
//!
//! Provides the worker command plus producer and operator commands for
//! enqueueing, inspecting, cancelling, recovering, and purging tasks.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands, StatsFormat};
