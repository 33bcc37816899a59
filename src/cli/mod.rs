//! CLI module for the Topoform engine.
//!
//! This module provides the command-line interface for planning,
//! applying and inspecting resource topologies.

mod commands;
mod output;

pub use commands::{Cli, Commands, LogFormat, OutputFormat, StateCommands};
pub use output::OutputFormatter;
