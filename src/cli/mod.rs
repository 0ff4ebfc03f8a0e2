//! CLI layer for Memory Bank.
//!
//! Provides the command-line interface using clap, with commands for
//! capturing, searching, and packing session context.

pub mod commands;
pub mod output;
pub mod parser;

pub use commands::{execute, CommandResult};
pub use parser::{Cli, Commands, HooksCommands, ProjectsCommands};
