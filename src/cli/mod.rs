//! Command-line interface for covorch.
//!
//! Provides commands for recording lifecycle snapshots, inspecting the
//! state-change log of an event, and checking whether a commit is ready
//! to finalise.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config;
use crate::core::{
    EventStateService, EventStore, FinalisationDecision, FinalisedEventPublisher, JsonlEventStore,
    LoggingPublisher, Orchestrator, TraceContext,
};
use crate::domain::{CommitIdentity, EventKey, OrchestratedEvent};

/// covorch - Event-sourced coverage orchestrator
#[derive(Parser, Debug)]
#[command(name = "covorch")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a lifecycle snapshot (JSON) and finalise its commit when ready
    Record {
        /// Snapshot file (reads from stdin if not provided)
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Correlation ID for this invocation (generated if not provided)
        #[arg(long, env = "COVORCH_TRACE_ID")]
        trace_id: Option<String>,
    },

    /// Show the reduced state of an event
    State {
        /// Event key (<provider>:<owner>:<repository>:<ref>:<commit>:<type>:<id>)
        event_key: String,
    },

    /// List the raw state changes of an event
    Changes {
        /// Event key
        event_key: String,
    },

    /// Check whether a commit is ready to finalise
    Ready {
        #[command(flatten)]
        commit: CommitArgs,

        /// Correlation ID for this invocation (generated if not provided)
        #[arg(long, env = "COVORCH_TRACE_ID")]
        trace_id: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Commit identity arguments
#[derive(clap::Args, Debug)]
pub struct CommitArgs {
    /// Version-control provider
    #[arg(long, default_value = "github")]
    pub provider: String,

    /// Repository owner
    #[arg(long)]
    pub owner: String,

    /// Repository name
    #[arg(long)]
    pub repository: String,

    /// Branch or pull request ref
    #[arg(long = "ref")]
    pub git_ref: String,

    /// Commit SHA
    #[arg(long)]
    pub commit: String,
}

impl From<CommitArgs> for CommitIdentity {
    fn from(args: CommitArgs) -> Self {
        CommitIdentity::new(
            args.provider,
            args.owner,
            args.repository,
            args.git_ref,
            args.commit,
        )
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Record { input, trace_id } => record(input, trace_id).await,
            Commands::State { event_key } => show_state(&event_key).await,
            Commands::Changes { event_key } => list_changes(&event_key).await,
            Commands::Ready { commit, trace_id } => check_ready(commit.into(), trace_id).await,
            Commands::Config => show_config(),
        }
    }
}

fn trace_context(trace_id: Option<String>) -> TraceContext {
    trace_id
        .map(TraceContext::new)
        .unwrap_or_else(TraceContext::generate)
}

/// Build an orchestrator over the configured store
async fn open_orchestrator() -> Result<Orchestrator<JsonlEventStore>> {
    let config = config::config()?;
    let store = JsonlEventStore::open_default().await?;

    Ok(Orchestrator::new(store).with_backoff(
        config.backoff.recorder_strategy(),
        config.backoff.ready_to_finalise_strategy(),
    ))
}

fn read_input(input_file: Option<PathBuf>) -> Result<String> {
    if let Some(path) = input_file {
        return std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()));
    }

    if io::stdin().is_terminal() {
        anyhow::bail!("No input provided. Use --input <file> or pipe to stdin");
    }

    let mut buffer = String::new();
    io::stdin()
        .read_to_string(&mut buffer)
        .context("Failed to read from stdin")?;
    Ok(buffer)
}

/// Record a snapshot and publish a finalised event if one was produced
async fn record(input_file: Option<PathBuf>, trace_id: Option<String>) -> Result<()> {
    let input = read_input(input_file)?;
    if input.trim().is_empty() {
        anyhow::bail!("Input is empty");
    }

    let event: OrchestratedEvent =
        serde_json::from_str(&input).context("Failed to parse orchestrated event")?;
    let trace = trace_context(trace_id);

    let orchestrator = open_orchestrator().await?;
    let outcome = orchestrator.handle(&event, &trace).await?;

    println!("Event: {}", event.event_key());
    println!("Trace: {}", trace.trace_id);
    println!("Record: {:?}", outcome.record);

    match outcome.finalisation {
        FinalisationDecision::Finalised(finalised) => {
            LoggingPublisher.publish(&finalised, &trace).await?;
            println!("Finalised: {:?}", finalised.state());
        }
        FinalisationDecision::NotReady(state) => {
            println!("Not ready to finalise (state: {:?})", state);
        }
        FinalisationDecision::AlreadyFinalised => println!("Already finalised"),
        FinalisationDecision::NotApplicable => {}
    }

    Ok(())
}

/// Show the reduced snapshot of an event
async fn show_state(event_key: &str) -> Result<()> {
    let key: EventKey = event_key.parse()?;
    let orchestrator = open_orchestrator().await?;

    let collection = orchestrator.store().list_state_changes(&key).await?;
    let event = orchestrator
        .state_service()
        .reduce_state_changes_to_event(&collection)?;

    match event {
        Some(event) => {
            println!("{}", serde_json::to_string_pretty(&event)?);
            eprintln!("[{} state changes]", collection.len());
        }
        None => {
            println!("No state changes recorded for {}", key);
        }
    }

    Ok(())
}

/// List the state changes of an event
async fn list_changes(event_key: &str) -> Result<()> {
    let key: EventKey = event_key.parse()?;
    let orchestrator = open_orchestrator().await?;
    let collection = orchestrator.store().list_state_changes(&key).await?;

    if collection.is_empty() {
        println!("No state changes recorded for {}", key);
        return Ok(());
    }

    println!("{:<8} {:<12} {:<26} CHANGES", "VERSION", "TYPE", "RECORDED");
    println!("{}", "-".repeat(80));

    for change in collection.iter() {
        println!(
            "{:<8} {:<12} {:<26} {}",
            change.version,
            change.event_type.as_str(),
            change.recorded_at.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            serde_json::Value::Object(change.changes.clone())
        );
    }

    Ok(())
}

/// Poll the commit's finalisation state
async fn check_ready(commit: CommitIdentity, trace_id: Option<String>) -> Result<()> {
    let trace = trace_context(trace_id);
    let orchestrator = open_orchestrator().await?;

    let (readiness, state) = orchestrator.ready_to_finalise(&commit, &trace).await?;

    println!("Commit: {}", commit);
    println!("State: {:?}", state);
    println!("Readiness: {:?}", readiness);

    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let config = config::config()?;

    println!("covorch Configuration");
    println!("=====================");
    println!();
    match &config.config_file {
        Some(path) => println!("Config file: {}", path.display()),
        None => println!("Config file: (none, using defaults)"),
    }
    println!("Home: {}", config.home.display());
    println!("Events: {}", config.events_dir().display());
    println!();
    println!("Invocation timeout: {}s", config.invocation_timeout.as_secs());
    for (name, strategy) in [
        ("recorder", &config.backoff.recorder),
        ("ready_to_finalise", &config.backoff.ready_to_finalise),
    ] {
        println!(
            "Backoff {}: {} attempts, {}ms base, exponent {} (max wait {}ms)",
            name,
            strategy.max_attempts,
            strategy.base_delay.as_millis(),
            strategy.exponent,
            strategy.max_total_delay().as_millis()
        );
    }

    Ok(())
}
