//! CLI command definitions

use crate::core::{InterruptFilter, InterruptState, InterruptType};
use clap::Args;
use uuid::Uuid;

/// Run a plan
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Setup abstractions (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub set: Vec<(String, String)>,

    /// Don't save the execution to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a plan file
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to plan YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show execution history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Number of recent executions to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show the interrupts of a plan execution, newest first
#[derive(Debug, Args, Clone)]
pub struct InterruptsCommand {
    /// Plan execution ID
    #[arg(long)]
    pub execution_id: Uuid,

    /// Only interrupts in these states
    #[arg(long = "state")]
    pub states: Vec<InterruptState>,

    /// Only interrupts of these types
    #[arg(long = "type")]
    pub types: Vec<InterruptType>,
}

impl InterruptsCommand {
    pub fn filter(&self) -> InterruptFilter {
        InterruptFilter {
            states: (!self.states.is_empty()).then(|| self.states.clone()),
            types: (!self.types.is_empty()).then(|| self.types.clone()),
        }
    }
}

/// Show one plan execution
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    /// Plan execution ID
    #[arg(long)]
    pub execution_id: Uuid,

    /// Include replaced retry attempts
    #[arg(long)]
    pub all_attempts: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 || parts[0].is_empty() {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
