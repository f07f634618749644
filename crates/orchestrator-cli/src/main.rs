//! Orchestrator front end
//!
//! ```bash
//! # Read line-delimited JSON requests from stdin
//! ai-orchestrator
//! echo '{"task":"optimize the parser","priority":"high"}' | ai-orchestrator serve
//!
//! # One-shot task
//! ai-orchestrator submit --task "review the auth module" --priority low
//!
//! # Inspect a persisted task
//! ai-orchestrator status task_0f8e7c1a-3b2d-4c5e-9f60-1a2b3c4d5e6f
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use coordination::{
    ErrorResponse, Orchestrator, OrchestratorConfig, Priority, TaskOptions, TaskStateStore,
};
use tokio::io::{stderr, stdin, stdout, BufReader};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file (environment variables still override it)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Coordination directory (overrides config and AI_COORDINATION_DIR)
    #[arg(long, global = true)]
    coordination_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve requests from stdin until EOF
    Serve,
    /// Run a single task and print its report
    Submit {
        #[arg(long)]
        task: String,
        /// low | normal | high
        #[arg(long, default_value = "normal")]
        priority: String,
        /// Task-level timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Print a persisted task as JSON
    Status { task_id: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut config = OrchestratorConfig::load(args.config.as_deref())?;
    if let Some(dir) = args.coordination_dir {
        config.coordination_dir = Some(dir);
    }

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Submit {
            task,
            priority,
            timeout_ms,
        } => submit(config, &task, &priority, timeout_ms).await,
        Command::Status { task_id } => status(&config, &task_id),
    }
}

fn orchestrator(config: OrchestratorConfig) -> Result<Orchestrator> {
    info!(
        coordination_dir = %config.coordination_dir().display(),
        max_concurrency = config.max_concurrency,
        "Orchestrator starting"
    );
    Orchestrator::from_config(config).context("Failed to initialize orchestrator")
}

async fn serve(config: OrchestratorConfig) -> Result<ExitCode> {
    let orchestrator = orchestrator(config)?;
    let handled = coordination::serve(&orchestrator, BufReader::new(stdin()), stdout(), stderr())
        .await
        .context("Failed to serve requests")?;
    info!(handled, "Input closed, shutting down");
    Ok(ExitCode::SUCCESS)
}

async fn submit(
    config: OrchestratorConfig,
    task: &str,
    priority: &str,
    timeout_ms: Option<u64>,
) -> Result<ExitCode> {
    let priority: Priority = match priority.parse() {
        Ok(priority) => priority,
        Err(e) => return Ok(print_error(ErrorResponse::new(e.to_string()))),
    };
    let orchestrator = orchestrator(config)?;
    let options = TaskOptions {
        task_timeout: timeout_ms.map(std::time::Duration::from_millis),
        ..TaskOptions::default()
    };

    match orchestrator.orchestrate_task(task, priority, options).await {
        Ok(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => Ok(print_error(failure.into())),
    }
}

fn status(config: &OrchestratorConfig, task_id: &str) -> Result<ExitCode> {
    let store = TaskStateStore::new(config.coordination_dir(), config.state_rotation());
    let task = store
        .find_task(task_id)
        .with_context(|| format!("Failed to read state from {}", store.path().display()))?;

    match task {
        Some(task) => {
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(ExitCode::SUCCESS)
        }
        None => Ok(print_error(ErrorResponse::new(format!(
            "Task not found: {task_id}"
        )))),
    }
}

fn print_error(response: ErrorResponse) -> ExitCode {
    let line = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"error":"unknown"}"#.to_string());
    eprintln!("{line}");
    ExitCode::FAILURE
}
