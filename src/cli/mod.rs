//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{HistoryCommand, InterruptsCommand, RunCommand, StatusCommand, ValidateCommand};
use std::ffi::OsString;

/// Resumable plan orchestrator
#[derive(Debug, Parser, Clone)]
#[command(name = "orchestrator")]
#[command(version = "0.1.0")]
#[command(about = "Run and inspect resumable execution plans", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine configuration file
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run a plan until it reaches a final status
    Run(RunCommand),

    /// Validate a plan file
    Validate(ValidateCommand),

    /// Show recent plan executions
    History(HistoryCommand),

    /// Show the interrupts of a plan execution
    Interrupts(InterruptsCommand),

    /// Show one plan execution and its node executions
    Status(StatusCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
