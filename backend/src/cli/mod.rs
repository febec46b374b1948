//! Command-line interface for repo-keeper.

pub mod commands;
pub mod runner;

pub use commands::{Cli, Command, OutputFormat};
pub use runner::{assemble, bootstrap, run, App, Report};
