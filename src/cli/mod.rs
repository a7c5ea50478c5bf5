//! Command-line interface for adops.
//!
//! Provides commands for serving the API, running workflows in-process,
//! inspecting execution history and agent traffic, and following a live
//! execution on a running server.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::client::{ExecutionView, LiveClient};
use crate::config::{self, ResolvedConfig};
use crate::domain::{ExecutionRecord, ExecutionStatus};
use crate::engine::{CommunicationBus, EventBus, ExecutionStore, MessageQuery, RunRequest, WorkflowRegistry};
use crate::server::{self, AppState};

/// adops - Event-driven workflow orchestrator for ad operations
#[derive(Parser, Debug)]
#[command(name = "adops")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP + SSE server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Run a workflow in-process and print the final record
    Run {
        /// Workflow id
        workflow: String,

        /// Input parameter as key=value (value parsed as JSON when possible)
        #[arg(short, long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// JSON file with input parameters
        #[arg(long = "params", value_name = "FILE")]
        params_file: Option<PathBuf>,

        /// Correlating project id
        #[arg(long)]
        project: Option<String>,
    },

    /// Show one execution
    Status {
        /// Workflow id
        workflow: String,

        /// Execution ID (UUID)
        execution_id: String,
    },

    /// List recent executions of a workflow
    History {
        /// Workflow id
        workflow: String,

        /// Maximum number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List registered workflows
    Workflows,

    /// Show the agent message log
    Messages {
        /// Only messages of this session
        #[arg(short, long)]
        query_id: Option<String>,

        /// Keep only the most recent N messages
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show event counts by type
    Events,

    /// Follow an execution on a running server until it finishes
    Watch {
        /// Workflow id
        workflow: String,

        /// Execution ID (UUID)
        execution_id: String,

        /// Server base URL (defaults to the configured bind address)
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let cfg = config::config()?;

        match self.command {
            Commands::Serve { bind } => serve(cfg, bind).await,
            Commands::Run {
                workflow,
                params,
                params_file,
                project,
            } => run_workflow(cfg, &workflow, &params, params_file.as_deref(), project).await,
            Commands::Status { workflow, execution_id } => show_status(cfg, &workflow, &execution_id),
            Commands::History { workflow, limit } => list_history(cfg, &workflow, limit),
            Commands::Workflows => list_workflows(cfg),
            Commands::Messages { query_id, limit } => list_messages(cfg, query_id, limit),
            Commands::Events => show_event_stats(cfg),
            Commands::Watch {
                workflow,
                execution_id,
                server,
            } => watch(cfg, &workflow, &execution_id, server).await,
            Commands::Config => show_config(cfg),
        }
    }
}

async fn serve(cfg: &ResolvedConfig, bind: Option<String>) -> Result<()> {
    match bind {
        Some(bind) => {
            let mut cfg = cfg.clone();
            cfg.bind = bind;
            server::serve(&cfg).await
        }
        None => server::serve(cfg).await,
    }
}

/// Run a workflow to completion with the configured connectors
async fn run_workflow(
    cfg: &ResolvedConfig,
    workflow: &str,
    params: &[String],
    params_file: Option<&Path>,
    project: Option<String>,
) -> Result<()> {
    let mut input = match params_file {
        Some(path) => load_params_file(path)?,
        None => Map::new(),
    };
    for param in params {
        let (key, value) = parse_param(param)?;
        input.insert(key, value);
    }

    let state = AppState::bootstrap(cfg)?;
    let mut request = RunRequest::new(workflow, input);
    if let Some(project) = project {
        request = request.with_project(project);
    }

    let record = state.orchestrator.run(request).await?;
    println!("{}", serde_json::to_string_pretty(&record)?);

    match record.status {
        ExecutionStatus::Completed => {
            eprintln!("\n[Execution {} completed]", record.id);
            Ok(())
        }
        ExecutionStatus::Warning => {
            eprintln!("\n[Execution {} completed with warnings]", record.id);
            Ok(())
        }
        status => anyhow::bail!(
            "Execution {} {}: {}",
            record.id,
            status.as_str(),
            record.error.as_deref().unwrap_or("no error recorded")
        ),
    }
}

fn show_status(cfg: &ResolvedConfig, workflow: &str, execution_id: &str) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let store = restore_store(cfg)?;
    let record = store
        .get(workflow, execution_id)
        .with_context(|| format!("Execution {} of '{}' not found", execution_id, workflow))?;

    print_record(&record);
    Ok(())
}

fn list_history(cfg: &ResolvedConfig, workflow: &str, limit: usize) -> Result<()> {
    let store = restore_store(cfg)?;
    let records = store.history(workflow, limit);

    if records.is_empty() {
        println!("No executions found for '{}'", workflow);
        return Ok(());
    }

    println!("{:<38} {:<11} {:<8} {:<25}", "EXECUTION ID", "STATUS", "STAGES", "CREATED");
    println!("{}", "-".repeat(84));
    for record in records {
        let done = record.stages.iter().filter(|s| s.status.is_terminal()).count();
        println!(
            "{:<38} {:<11} {:<8} {:<25}",
            record.id,
            record.status.as_str(),
            format!("{}/{}", done, record.stages.len()),
            record.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    Ok(())
}

fn list_workflows(cfg: &ResolvedConfig) -> Result<()> {
    let registry = WorkflowRegistry::new();
    if cfg.workflows.is_dir() {
        registry.load_dir(&cfg.workflows)?;
    }

    let workflows = registry.list();
    if workflows.is_empty() {
        println!("No workflows found in {}", cfg.workflows.display());
        return Ok(());
    }

    println!("{:<28} {:<16} {:<8} {}", "ID", "CATEGORY", "STAGES", "NAME");
    println!("{}", "-".repeat(80));
    for workflow in workflows {
        let marker = if workflow.is_orchestrator { " (orchestrator)" } else { "" };
        println!(
            "{:<28} {:<16} {:<8} {}{}",
            workflow.id,
            workflow.category,
            workflow.stages.len(),
            workflow.name,
            marker
        );
    }
    Ok(())
}

fn list_messages(cfg: &ResolvedConfig, query_id: Option<String>, limit: Option<usize>) -> Result<()> {
    let bus = CommunicationBus::open(cfg.messages_log_path(), cfg.bus.max_messages_per_session)
        .context("Failed to open message log")?;
    let messages = bus.get_messages(&MessageQuery { query_id, limit });

    if messages.is_empty() {
        println!("No messages found");
        return Ok(());
    }

    for message in messages {
        let payload = match message.payload {
            Value::String(ref text) => text.clone(),
            ref other => other.to_string(),
        };
        println!(
            "{} [{}] {} -> {} ({}): {}",
            message.timestamp.format("%H:%M:%S"),
            message.query_id.as_deref().unwrap_or("-"),
            message.from,
            message.to,
            message.message_type,
            payload
        );
    }
    Ok(())
}

fn show_event_stats(cfg: &ResolvedConfig) -> Result<()> {
    let bus = EventBus::open(cfg.events_log_path(), cfg.bus.live_capacity).context("Failed to open event log")?;
    let stats = bus.stats();

    println!("Total events: {}", stats.total);
    for (event_type, count) in &stats.by_type {
        println!("  {:<22} {}", event_type, count);
    }
    Ok(())
}

/// Follow a live execution, printing each stage as its status changes
async fn watch(cfg: &ResolvedConfig, workflow: &str, execution_id: &str, server: Option<String>) -> Result<()> {
    let execution_id = parse_execution_id(execution_id)?;
    let base_url = server.unwrap_or_else(|| format!("http://{}", cfg.bind));
    let client = LiveClient::new(base_url).with_policy(cfg.reconnect.clone());

    let mut last: Vec<String> = Vec::new();
    let record = client
        .watch(workflow, execution_id, |view: &ExecutionView| {
            let lines = stage_lines(view.record());
            for line in lines.iter().filter(|l| !last.contains(l)) {
                println!("{}", line);
            }
            last = lines;
        })
        .await?;

    println!();
    print_record(&record);
    Ok(())
}

fn show_config(cfg: &ResolvedConfig) -> Result<()> {
    println!("adops configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Workflows:  {}", cfg.workflows.display());
    println!("  Event log:  {}", cfg.events_log_path().display());
    println!("  Messages:   {}", cfg.messages_log_path().display());
    println!();
    println!("Server:");
    println!("  Bind: {}", cfg.bind);
    println!();
    println!("Bus:");
    println!("  Max messages per session: {}", cfg.bus.max_messages_per_session);
    println!("  Live capacity:            {}", cfg.bus.live_capacity);
    println!();
    println!("Limits:");
    println!("  Max depth:       {}", cfg.limits.max_depth);
    println!("  Max branches:    {}", cfg.limits.max_branches);
    println!("  Max input bytes: {}", cfg.limits.max_input_bytes);
    println!();
    println!("Connectors:");
    if cfg.connectors.is_empty() {
        println!("  (none)");
    }
    for (agent, connector) in &cfg.connectors {
        println!("  {}: {:?}", agent, connector);
    }
    Ok(())
}

/// Rebuild execution records from the event log
fn restore_store(cfg: &ResolvedConfig) -> Result<ExecutionStore> {
    let events = EventBus::open(cfg.events_log_path(), cfg.bus.live_capacity).context("Failed to open event log")?;
    let store = ExecutionStore::new();
    store.restore(events.history());
    Ok(store)
}

fn print_record(record: &ExecutionRecord) {
    println!("Execution: {}", record.id);
    println!("Workflow:  {}", record.workflow_id);
    println!("Status:    {}", record.status.as_str());
    if let Some(started) = record.started_at {
        println!("Started:   {}", started);
    }
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed);
    }
    if let Some(ref error) = record.error {
        println!("Error:     {}", error);
    }
    println!("\nStages:");
    for line in stage_lines(record) {
        println!("{}", line);
    }
}

fn stage_lines(record: &ExecutionRecord) -> Vec<String> {
    record
        .stages
        .iter()
        .map(|stage| {
            let mut line = format!("  {:<24} {}", stage.id, stage.status.as_str());
            if let Some(ref error) = stage.error {
                line.push_str(&format!(" ({})", error));
            }
            line
        })
        .collect()
}

fn parse_execution_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid execution ID: {}", value))
}

/// Split `key=value`; the value is JSON if it parses, otherwise a string
fn parse_param(param: &str) -> Result<(String, Value)> {
    let (key, raw) = param
        .split_once('=')
        .with_context(|| format!("Invalid parameter '{}', expected KEY=VALUE", param))?;
    let key = key.trim();
    if key.is_empty() {
        anyhow::bail!("Invalid parameter '{}': empty key", param);
    }

    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}

fn load_params_file(path: &Path) -> Result<Map<String, Value>> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("Failed to read params file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Params file must be a JSON object: {}", path.display()))
}
