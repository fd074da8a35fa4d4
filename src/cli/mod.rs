//! CLI module for the thot stack tool.
//!
//! This module provides the command-line interface for planning,
//! applying and tearing down a stack.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
