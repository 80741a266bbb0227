use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use convoy_observability::{
    emit_event, init_process_logging, logs_dir_for_workspace, ObservabilityEvent, ProcessKind,
};
use convoy_orchestrator::{
    plan_partitions, AbortTarget, Orchestrator, OrchestratorConfig, OrchestratorEvent, Run,
    RunMode, RunStore,
};
use convoy_providers::ProcessProvider;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "convoy")]
#[command(about = "Drive coding agents through a todo list under a budget")]
struct Cli {
    /// Project workspace holding the todo file.
    #[arg(long, global = true, env = "CONVOY_WORKSPACE", default_value = ".")]
    workspace: PathBuf,
    /// YAML or JSON orchestrator config.
    #[arg(long, global = true, env = "CONVOY_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new run and dispatch it to completion.
    Run {
        task: String,
        #[arg(long, default_value = "sequential-multi")]
        mode: RunMode,
        /// Print events as JSON lines instead of log lines.
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Continue an interrupted run from its last snapshot.
    Resume {
        run_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List known runs, active and archived.
    Status {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Preview how the todo list would be partitioned.
    Partitions {
        #[arg(long, default_value = "sequential-multi")]
        mode: RunMode,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let workspace = std::fs::canonicalize(&cli.workspace)
        .with_context(|| format!("workspace {} not found", cli.workspace.display()))?;
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run { task, mode, json } => {
            let _log_guard = init_logging(ProcessKind::Run, &workspace, &config)?;
            let provider = build_provider(&config, &workspace)?;
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let orchestrator = Orchestrator::builder(&workspace, config, provider)
                .events(events_tx)
                .process(ProcessKind::Run)
                .start(&task, mode)
                .await
                .context("failed to start run")?;
            info!(run_id = %orchestrator.run_id(), mode = mode.as_str(), "run started");
            let run = drive(orchestrator, events_rx, json).await?;
            print_outcome(&run);
        }
        Command::Resume { run_id, json } => {
            let _log_guard = init_logging(ProcessKind::Resume, &workspace, &config)?;
            let provider = build_provider(&config, &workspace)?;
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let orchestrator = Orchestrator::builder(&workspace, config, provider)
                .events(events_tx)
                .process(ProcessKind::Resume)
                .resume(&run_id)
                .await
                .with_context(|| format!("failed to resume run {}", run_id))?;
            let run = drive(orchestrator, events_rx, json).await?;
            print_outcome(&run);
        }
        Command::Status { json } => {
            let store = RunStore::new(&workspace, &config.state_dir)?;
            let runs = store.list_runs()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&runs)?);
            } else if runs.is_empty() {
                println!("no runs under {}", workspace.join(&config.state_dir).display());
            } else {
                for run in runs {
                    println!(
                        "{}  {:<16} {:<16} ${:.4}{}  {}",
                        run.id,
                        run.status.as_str(),
                        run.mode,
                        run.spent,
                        if run.archived { " (archived)" } else { "" },
                        run.task_description
                    );
                }
            }
        }
        Command::Partitions { mode } => {
            let plan = plan_partitions(&workspace, &config, mode).await?;
            for warning in &plan.warnings {
                eprintln!("warning: {}", warning);
            }
            if plan.partitions.is_empty() {
                println!("nothing to do: every todo is finished");
            }
            for partition in &plan.partitions {
                let paths = partition
                    .allowed_paths
                    .iter()
                    .map(|p| display_relative(p, &workspace))
                    .collect::<Vec<_>>();
                println!(
                    "{} ({} todos) -> {}",
                    partition.id,
                    partition.todo_ids.len(),
                    paths.join(", ")
                );
                for id in &partition.todo_ids {
                    if let Some(todo) = plan.todos.iter().find(|t| &t.id == id) {
                        println!("  [{}] {} {}", todo.status.marker(), todo.id, todo.text);
                    }
                }
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<OrchestratorConfig> {
    let mut config = match path {
        Some(path) => OrchestratorConfig::load(path)?,
        None => OrchestratorConfig::default(),
    };
    config.apply_env_overrides()?;
    Ok(config)
}

fn init_logging(
    process: ProcessKind,
    workspace: &Path,
    config: &OrchestratorConfig,
) -> anyhow::Result<WorkerGuard> {
    let logs_dir = logs_dir_for_workspace(workspace, &config.state_dir);
    let (guard, log_info) = init_process_logging(process, &logs_dir, LOG_RETENTION_DAYS)?;
    emit_event(
        tracing::Level::INFO,
        process,
        ObservabilityEvent::new("engine.main", "logging.initialized")
            .status("ok")
            .detail(&log_info.logs_dir),
    );
    Ok(guard)
}

fn build_provider(
    config: &OrchestratorConfig,
    workspace: &Path,
) -> anyhow::Result<Arc<ProcessProvider>> {
    let provider = config
        .provider
        .clone()
        .context("config has no `provider` section; set provider.command to a model bridge")?;
    Ok(Arc::new(ProcessProvider::new(provider, workspace)))
}

/// Dispatches the run while relaying its events. Ctrl-C aborts every session;
/// the run still finishes and is persisted.
async fn drive(
    orchestrator: Orchestrator,
    mut events_rx: mpsc::UnboundedReceiver<OrchestratorEvent>,
    json: bool,
) -> anyhow::Result<Run> {
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            report_event(&event, json);
        }
    });

    let aborter = orchestrator.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!(run_id = %aborter.run_id(), "interrupt received, aborting sessions");
            if let Err(err) = aborter.abort(AbortTarget::All).await {
                warn!("abort failed: {}", err);
            }
        }
    });

    let result = orchestrator.dispatch().await;
    interrupt.abort();
    let _ = interrupt.await;
    // Dropping the last sender ends the printer.
    drop(orchestrator);
    let _ = printer.await;
    result.context("dispatch failed")
}

fn report_event(event: &OrchestratorEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(err) => warn!("unprintable event: {}", err),
        }
        return;
    }
    match event {
        OrchestratorEvent::SessionCreated {
            session_id,
            partition_id,
            ..
        } => info!(session_id = %session_id, partition = %partition_id, "session created"),
        OrchestratorEvent::SessionStateChanged {
            session_id, from, to, ..
        } => info!(session_id = %session_id, "{} -> {}", from.as_str(), to.as_str()),
        OrchestratorEvent::AuditCompleted {
            session_id,
            verdict,
            retry_count,
            ..
        } => info!(session_id = %session_id, retry_count, "audit {}", verdict.as_str()),
        OrchestratorEvent::BudgetExceeded {
            session_id,
            scope,
            reason,
            ..
        } => warn!(session_id = %session_id, "{} budget exceeded: {}", scope, reason),
        OrchestratorEvent::PartitionFinished {
            partition_id,
            status,
            ..
        } => info!(partition = %partition_id, "partition finished: {:?}", status),
        OrchestratorEvent::RunFinished { run_id, status, .. } => {
            info!(run_id = %run_id, "run finished: {}", status.as_str())
        }
        other => tracing::debug!("{:?}", other),
    }
}

fn print_outcome(run: &Run) {
    let counts = run.todo_counts();
    println!(
        "run {} {}: {} done, {} failed, {} open, ${:.4} spent",
        run.id,
        run.status.as_str(),
        counts.done,
        counts.failed,
        counts.open + counts.in_progress,
        run.budget.spent
    );
    for agent in &run.agents {
        if let Some(reason) = &agent.failure_reason {
            println!("  {} ({}): {}", agent.partition_id, agent.id, reason);
        }
    }
}

fn display_relative(path: &Path, workspace: &Path) -> String {
    match path.strip_prefix(workspace) {
        Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
        Ok(rel) => rel.display().to_string(),
        Err(_) => path.display().to_string(),
    }
}
