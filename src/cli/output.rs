//! CLI output formatting

use crate::{
    advise::AdviserResponse,
    core::{Interrupt, InterruptState, NodeExecution, PlanExecution, Status},
    execution::ExecutionEvent,
};
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use uuid::Uuid;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Spinner shown while a plan execution is in flight
pub fn create_spinner(message: &str) -> ProgressBar {
    let progress = ProgressBar::new_spinner();
    let template = ProgressStyle::default_spinner()
        .template("{spinner:.green} [{elapsed_precise}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    progress.set_style(template);
    progress.set_message(message.to_string());
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// First eight characters of an id
pub fn short_id(id: &Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Format a status for display
pub fn format_status(status: Status) -> String {
    let label = status.to_string();
    match status {
        Status::Queued => style(label).dim().to_string(),
        Status::Running | Status::TaskWaiting | Status::ChildWaiting => style(label).yellow().to_string(),
        Status::Paused | Status::Suspended | Status::InterventionWaiting => style(label).blue().to_string(),
        Status::Succeeded => style(label).green().to_string(),
        Status::Skipped | Status::IgnoreFailed => style(label).dim().green().to_string(),
        Status::Failed | Status::Errored | Status::Expired => style(label).red().to_string(),
        Status::Aborted | Status::Discontinuing => style(label).magenta().to_string(),
    }
}

fn status_icon(status: Status) -> Emoji<'static, 'static> {
    if status.is_positive() {
        CHECK
    } else if status.is_broken() {
        CROSS
    } else if status.is_final() {
        WARN
    } else {
        SPINNER
    }
}

fn format_advice(response: &AdviserResponse) -> String {
    match response {
        AdviserResponse::Proceed { next_node_ids } => format!("proceed to {}", next_node_ids.join(", ")),
        AdviserResponse::Retry {
            wait_interval_secs,
            attempt,
        } => format!("retry #{} in {}s", attempt, wait_interval_secs),
        AdviserResponse::Rollback { strategy, node_id } => format!("rollback ({}) via {}", strategy, node_id),
        AdviserResponse::EndPlan => "end plan".to_string(),
        AdviserResponse::InterventionWaiting { timeout_secs, .. } => {
            format!("wait for intervention ({}s)", timeout_secs)
        }
        AdviserResponse::IgnoreFailure { next_node_id } => match next_node_id {
            Some(next) => format!("ignore failure, continue at {}", next),
            None => "ignore failure".to_string(),
        },
    }
}

/// Format an execution event for display
pub fn format_execution_event(event: &ExecutionEvent) -> String {
    match event {
        ExecutionEvent::PlanStarted {
            plan_execution_id,
            plan_id,
        } => format!(
            "{} Starting plan {} ({})",
            ROCKET,
            style(plan_id).bold(),
            style(short_id(plan_execution_id)).dim()
        ),
        ExecutionEvent::NodeStatusChanged {
            node_execution_id,
            node_id,
            from,
            to,
            ..
        } => format!(
            "{} {} {} → {} ({})",
            status_icon(*to),
            style(node_id).cyan(),
            format_status(*from),
            format_status(*to),
            style(short_id(node_execution_id)).dim()
        ),
        ExecutionEvent::AdviserResponded { node_id, response, .. } => {
            format!("{} {}: {}", INFO, style(node_id).yellow(), format_advice(response))
        }
        ExecutionEvent::InterruptRegistered {
            interrupt_id,
            interrupt_type,
            ..
        } => format!(
            "{} Interrupt {} registered ({})",
            WARN,
            style(interrupt_type).bold(),
            style(short_id(interrupt_id)).dim()
        ),
        ExecutionEvent::InterruptProcessed { interrupt_id, state, .. } => {
            let state = match state {
                InterruptState::ProcessedSuccessfully => style(state).green().to_string(),
                InterruptState::ProcessedUnsuccessfully => style(state).red().to_string(),
                _ => style(state).dim().to_string(),
            };
            format!("{} Interrupt {} {}", INFO, style(short_id(interrupt_id)).dim(), state)
        }
        ExecutionEvent::PlanCompleted {
            plan_execution_id,
            status,
        } => format!(
            "{} Plan execution ({}) finished {}",
            status_icon(*status),
            style(short_id(plan_execution_id)).dim(),
            format_status(*status)
        ),
    }
}

/// One-line summary of a plan execution
pub fn format_plan_execution(execution: &PlanExecution) -> String {
    let duration = match (execution.started_at, execution.ended_at) {
        (Some(start), Some(end)) => end
            .signed_duration_since(start)
            .to_std()
            .map(format_duration)
            .unwrap_or_default(),
        _ => String::new(),
    };
    format!(
        "{} {} - {} - {} - {} {}",
        status_icon(execution.status),
        style(short_id(&execution.id)).dim(),
        style(&execution.plan_id).bold(),
        format_status(execution.status),
        style(execution.created_at.to_rfc3339()).dim(),
        style(duration).dim()
    )
}

/// One line per node execution, indented by ambiance depth
pub fn format_node_execution(execution: &NodeExecution) -> String {
    let depth = execution.ambiance.levels.len().saturating_sub(1);
    let mut line = format!(
        "{}{} {} {}",
        "  ".repeat(depth),
        status_icon(execution.status),
        style(&execution.node_id).cyan(),
        format_status(execution.status)
    );
    if !execution.retry_ids.is_empty() {
        line.push_str(&format!(" {}", style(format!("(attempt {})", execution.retry_ids.len() + 1)).dim()));
    }
    if execution.old_retry {
        line.push_str(&format!(" {}", style("[replaced]").dim()));
    }
    if let Some(failure) = &execution.failure {
        line.push_str(&format!(": {}", style(&failure.message).red()));
    }
    line
}

/// One line per interrupt
pub fn format_interrupt(interrupt: &Interrupt) -> String {
    let target = interrupt
        .node_execution_id
        .map(|id| short_id(&id))
        .unwrap_or_else(|| "plan".to_string());
    let mut line = format!(
        "{} {} {} → {} [{}]",
        style(interrupt.created_at.to_rfc3339()).dim(),
        style(interrupt.interrupt_type).bold(),
        style(target).cyan(),
        interrupt.state,
        style(short_id(&interrupt.id)).dim()
    );
    if let Some(message) = &interrupt.message {
        line.push_str(&format!(": {}", style(message).red()));
    }
    line
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
