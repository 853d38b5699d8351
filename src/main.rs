use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use rpaflow_browser::{BrowserSessionManager, ChromiumBackend};
use rpaflow_core::config::AppConfig;
use rpaflow_core::graph::{IssueSeverity, Workflow};
use rpaflow_core::types::{ExecutionEvent, ExecutionId, ExecutionStatus, RunRequest};
use rpaflow_engine::Engine;

#[derive(Parser)]
#[command(name = "rpaflow", version, about = "Run browser/API/script RPA workflow graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "rpaflow.toml", env = "RPAFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow file and print the run outcome
    Run {
        /// Workflow definition (JSON)
        workflow: PathBuf,
        /// Run input as a JSON object
        #[arg(short, long)]
        input: Option<String>,
        /// Execution ID (auto-generated if not provided)
        #[arg(long)]
        execution_id: Option<String>,
        /// Do not print per-node progress
        #[arg(short, long)]
        quiet: bool,
    },
    /// Check a workflow file for structural problems
    Validate {
        /// Workflow definition (JSON)
        workflow: PathBuf,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("rpaflow=info,warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "rpaflow", &mut io::stdout());
        return Ok(());
    }

    match cli.command {
        Commands::Validate { workflow } => validate(&workflow)?,
        Commands::Config => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Run {
            workflow,
            input,
            execution_id,
            quiet,
        } => {
            let config = load_config(&cli.config)?;
            let workflow = load_workflow(&workflow)?;
            let input = parse_input(input.as_deref())?;
            let execution_id = execution_id
                .map(|id| ExecutionId::from_string(&id))
                .unwrap_or_default();

            let request = RunRequest {
                workflow_id: workflow.id.clone(),
                execution_id,
                nodes: workflow.nodes,
                edges: workflow.edges,
                input,
            };
            let status = run(&config, request, quiet).await?;
            if status != ExecutionStatus::Completed {
                anyhow::bail!("workflow run {}", status);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    let config = AppConfig::load_or_default(path)?;
    if path.exists() {
        info!(path = %path.display(), "Loaded config");
    } else {
        info!(path = %path.display(), "No config file, using defaults");
    }
    Ok(config)
}

async fn run(config: &AppConfig, request: RunRequest, quiet: bool) -> anyhow::Result<ExecutionStatus> {
    let sessions = Arc::new(BrowserSessionManager::new(
        Arc::new(ChromiumBackend::new()),
        config.browser.clone(),
    ));
    let engine = Engine::new(config, sessions)?;

    // Spawn progress printer
    let printer = tokio::spawn(print_progress(engine.event_bus().subscribe(), quiet));

    let id = engine.start(request).await?;

    let outcome = tokio::select! {
        outcome = engine.wait(&id) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id = %id, "Interrupted, canceling run after the current node");
            engine.cancel(&id).await?;
            engine.wait(&id).await?
        }
    };

    printer.await.ok();
    engine.shutdown().await;

    let mut stdout = io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &outcome)?;
    writeln!(stdout)?;
    Ok(outcome.status)
}

/// Print node progress until a terminal run event arrives, and return it.
async fn print_progress(
    mut rx: broadcast::Receiver<ExecutionEvent>,
    quiet: bool,
) -> Option<ExecutionEvent> {
    loop {
        let event = match rx.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                debug!(skipped = n, "Progress printer lagged, skipped events");
                continue;
            }
            Err(RecvError::Closed) => return None,
        };
        let line = match &event {
            ExecutionEvent::NodeStarted {
                node_id, node_type, ..
            } => format!("[{}: {}]", node_type, node_id),
            ExecutionEvent::NodeFinished {
                node_id,
                success,
                elapsed_ms,
                ..
            } => {
                let mark = if *success { "ok" } else { "FAILED" };
                format!("[{}: {} in {}ms]", node_id, mark, elapsed_ms)
            }
            ExecutionEvent::RunCompleted { nodes_visited, .. } => {
                format!("[done: {} nodes]", nodes_visited)
            }
            ExecutionEvent::RunFailed { error, .. } => format!("[error: {}]", error),
            ExecutionEvent::RunCanceled { .. } => "[canceled]".to_string(),
            ExecutionEvent::RunStarted { .. } => continue,
        };
        if !quiet {
            eprintln!("{}", line);
        }
        if matches!(
            event,
            ExecutionEvent::RunCompleted { .. }
                | ExecutionEvent::RunFailed { .. }
                | ExecutionEvent::RunCanceled { .. }
        ) {
            return Some(event);
        }
    }
}

fn validate(path: &Path) -> anyhow::Result<()> {
    let workflow = load_workflow(path)?;
    let issues = workflow.validate();

    let mut errors = 0;
    for issue in &issues {
        let label = match issue.severity {
            IssueSeverity::Error => {
                errors += 1;
                "error"
            }
            IssueSeverity::Warning => "warning",
        };
        println!("{}: {}", label, issue.message);
    }

    if errors > 0 {
        anyhow::bail!("{} has {} error(s)", path.display(), errors);
    }
    println!(
        "{}: {} nodes, {} edges, {} warning(s)",
        workflow.name,
        workflow.nodes.len(),
        workflow.edges.len(),
        issues.len()
    );
    Ok(())
}

fn load_workflow(path: &Path) -> anyhow::Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read workflow {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse workflow {}", path.display()))
}

fn parse_input(
    raw: Option<&str>,
) -> anyhow::Result<Option<serde_json::Map<String, serde_json::Value>>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match serde_json::from_str::<serde_json::Value>(raw).context("--input is not valid JSON")? {
        serde_json::Value::Object(map) => Ok(Some(map)),
        other => anyhow::bail!("--input must be a JSON object, got {}", other),
    }
}
