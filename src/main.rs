use anyhow::{Context, Result};
use orchestrator::cli::commands::{HistoryCommand, InterruptsCommand, RunCommand, StatusCommand, ValidateCommand};
use orchestrator::cli::output::*;
use orchestrator::cli::{Cli, Command};
use orchestrator::consumer;
use orchestrator::core::{config::EngineConfig, InterruptType, Plan};
use orchestrator::dispatch::local::{EchoHandler, LocalTaskExecutor, SleepHandler};
use orchestrator::execution::{ExecutionEvent, OrchestrationEngine};
use orchestrator::persistence::{ExecutionStore, InMemoryStore};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path).with_context(|| format!("Failed to load config {}", path))?,
        None => EngineConfig::default(),
    };

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_plan(cmd, &config).await?,
        Command::Validate(cmd) => validate_plan(cmd)?,
        Command::History(cmd) => show_history(cmd, &config).await?,
        Command::Interrupts(cmd) => show_interrupts(cmd, &config).await?,
        Command::Status(cmd) => show_status(cmd, &config).await?,
    }

    Ok(())
}

async fn run_plan(cmd: &RunCommand, config: &EngineConfig) -> Result<()> {
    let plan = Plan::from_file(&cmd.file).context("Failed to load plan")?;
    let plan_name = plan.name().to_string();
    println!("{} Loaded plan: {}", INFO, style(&plan_name).bold());

    let setup: BTreeMap<String, String> = cmd.set.iter().cloned().collect();
    for (key, value) in &setup {
        println!("{} Setup: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let store = open_store(config, cmd.no_history).await?;
    let (publisher, consumer) = consumer::channel(config.partitions);
    let dispatcher = LocalTaskExecutor::new(publisher.clone())
        .register("sleep", Arc::new(SleepHandler))
        .register("echo", Arc::new(EchoHandler));
    let engine = OrchestrationEngine::builder(store, Arc::new(dispatcher), publisher)
        .config(config.clone())
        .build();

    // Event handler for console output
    let progress = create_spinner(&format!("Running {}", plan_name));
    let printer = progress.clone();
    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    engine
        .add_event_handler(move |event| {
            printer.println(format_execution_event(&event));
            if let ExecutionEvent::PlanCompleted {
                plan_execution_id,
                status,
            } = event
            {
                let _ = done_tx.send((plan_execution_id, status));
            }
        })
        .await;

    let handle = engine.start(consumer);
    println!();
    let execution_id = engine.start_plan(plan, setup).await?;

    let mut abort_requested = false;
    let status = loop {
        tokio::select! {
            Some((id, status)) = done_rx.recv() => {
                if id == execution_id {
                    break status;
                }
            }
            _ = tokio::signal::ctrl_c(), if !abort_requested => {
                abort_requested = true;
                progress.println(format!("{} Interrupted, aborting plan execution", WARN));
                let metadata = json!({ "source": "cli" });
                if let Err(e) = engine.register_interrupt(execution_id, InterruptType::Abort, None, metadata).await {
                    warn!("Could not abort {}: {}", execution_id, e);
                }
            }
        }
    };

    progress.finish_and_clear();
    handle.shutdown();
    let execution = engine.get_plan_execution(execution_id).await?;

    if !cmd.no_history {
        println!(
            "\n{} Execution saved to history (ID: {})",
            INFO,
            style(execution_id).dim()
        );
    }

    if status.is_positive() {
        println!("\n{} {} finished {}", CHECK, style(&plan_name).bold(), format_status(status));
    } else {
        println!("\n{} {} finished {}", CROSS, style(&plan_name).bold(), format_status(status));
        if let Some(failure) = &execution.failure {
            error!("{}", failure.message);
        }
        std::process::exit(1);
    }

    Ok(())
}

fn validate_plan(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating plan...", INFO);

    match Plan::from_file(&cmd.file) {
        Ok(plan) => {
            println!("{} Plan is valid!", CHECK);
            println!("  Name: {}", style(plan.name()).bold());
            println!("  Start node: {}", style(&plan.start_node_id).cyan());
            println!("  Nodes: {}", style(plan.nodes.len()).cyan());

            if cmd.json {
                let json = serde_json::to_string_pretty(&plan)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn show_history(cmd: &HistoryCommand, config: &EngineConfig) -> Result<()> {
    let store = open_store(config, false).await?;
    let executions = store.list_plan_executions(cmd.limit).await?;

    if executions.is_empty() {
        println!("{} No executions found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = json!({ "executions": executions });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    println!("{} Execution history (showing latest {}):", INFO, cmd.limit);
    for execution in &executions {
        println!("  {}", format_plan_execution(execution));
    }
    Ok(())
}

async fn show_interrupts(cmd: &InterruptsCommand, config: &EngineConfig) -> Result<()> {
    let store = open_store(config, false).await?;
    let interrupts = store.interrupts_for_plan(cmd.execution_id, &cmd.filter()).await?;

    if interrupts.is_empty() {
        println!("{} No interrupts found", INFO);
        return Ok(());
    }

    println!("{} Interrupts of {} (newest first):", INFO, style(cmd.execution_id).cyan());
    for interrupt in &interrupts {
        println!("  {}", format_interrupt(interrupt));
    }
    Ok(())
}

async fn show_status(cmd: &StatusCommand, config: &EngineConfig) -> Result<()> {
    let store = open_store(config, false).await?;
    let Some(execution) = store.get_plan_execution(cmd.execution_id).await? else {
        println!("{} Execution not found", WARN);
        return Ok(());
    };

    println!("{} Execution Details", INFO);
    println!("  ID: {}", style(execution.id).cyan());
    println!("  Plan: {}", style(&execution.plan_id).bold());
    println!("  Status: {}", format_status(execution.status));
    println!("  Created: {}", style(execution.created_at.to_rfc3339()).dim());
    if let (Some(started), Some(ended)) = (execution.started_at, execution.ended_at) {
        println!("  Ended: {}", style(ended.to_rfc3339()).dim());
        if let Ok(duration) = ended.signed_duration_since(started).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    if let Some(failure) = &execution.failure {
        println!("  Failure: {}", style(&failure.message).red());
    }

    let nodes = if cmd.all_attempts {
        store.node_executions_for_plan(execution.id).await?
    } else {
        store.node_executions_without_old_retries(execution.id).await?
    };
    println!("\n  {}", style("Nodes:").bold());
    for node in &nodes {
        println!("    {}", format_node_execution(node));
    }
    Ok(())
}

async fn open_store(config: &EngineConfig, in_memory: bool) -> Result<Arc<dyn ExecutionStore>> {
    if in_memory {
        return Ok(Arc::new(InMemoryStore::new()));
    }
    history_store(config).await
}

#[cfg(feature = "sqlite")]
async fn history_store(config: &EngineConfig) -> Result<Arc<dyn ExecutionStore>> {
    use orchestrator::persistence::SqliteExecutionStore;

    let path = config.database_path();
    let store = SqliteExecutionStore::at_path(&path)
        .await
        .with_context(|| format!("Failed to open history at {}", path.display()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "sqlite"))]
async fn history_store(_config: &EngineConfig) -> Result<Arc<dyn ExecutionStore>> {
    anyhow::bail!("Execution history needs the sqlite feature; use --no-history")
}
