use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use resumable_analysis::{
    config::{Config, LogFormat},
    orchestrator::Topic,
    reasoning::ReasoningClient,
    server::{AppState, McpServer},
    storage::{CheckpointStatus, SharedStore, SqliteStorage},
};

/// Checkpointed, resumable analysis over an external reasoning service.
#[derive(Parser, Debug)]
#[command(name = "resumable-analysis", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON-RPC query surface over stdio
    Serve,

    /// Start a new analysis session
    Run {
        /// Scenario config JSON file (hypotheses, paradigms, evidence queries)
        #[arg(long)]
        scenario: PathBuf,

        /// Proposition to analyze
        #[arg(long)]
        proposition: String,

        /// Scenario identifier recorded with the session
        #[arg(long, default_value = "default")]
        scenario_id: String,
    },

    /// Resume a failed session in a new session
    Resume {
        /// Id of the failed session
        session_id: String,
    },

    /// Run a multi-topic project file
    Project {
        /// Project JSON file with `topics` and `scenario_config`
        file: PathBuf,

        /// Skip topics already completed in the stored project checkpoint
        #[arg(long)]
        resume: bool,
    },

    /// List session checkpoints, newest first
    Checkpoints {
        /// Filter by status: in_progress, completed, failed
        #[arg(long)]
        status: Option<String>,
    },

    /// Print the audit log of one session
    Audit {
        session_id: String,

        #[arg(long, default_value = "0")]
        offset: u64,

        #[arg(long, default_value = "50")]
        limit: u64,
    },
}

#[derive(Debug, Deserialize)]
struct ProjectFile {
    topics: Vec<Topic>,
    #[serde(default)]
    scenario_config: serde_json::Value,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    info!(version = env!("CARGO_PKG_VERSION"), "resumable-analysis starting");

    let storage = SqliteStorage::new(&config.database).await.map_err(|e| {
        error!(error = %e, "Failed to initialize database");
        e
    })?;
    info!(path = %config.database.path.display(), "Database initialized");
    let store: SharedStore = Arc::new(storage);

    let client = ReasoningClient::new(&config.reasoning, &config.request)?;
    info!(base_url = %client.base_url(), "Reasoning client initialized");

    let state = Arc::new(AppState::new(config, store.clone(), Arc::new(client)));

    match cli.command {
        Command::Serve => {
            let server = McpServer::new(state);
            info!("Server ready, waiting for requests on stdin");
            server.run().await?;
            info!("Server shutdown complete");
        }
        Command::Run {
            scenario,
            proposition,
            scenario_id,
        } => {
            let scenario_config: serde_json::Value = read_json(&scenario)?;
            let result = state
                .analysis
                .start(&scenario_id, &proposition, scenario_config)
                .await?;
            print_json(&result)?;
        }
        Command::Resume { session_id } => {
            let result = state.analysis.resume(&session_id).await?;
            print_json(&result)?;
        }
        Command::Project { file, resume } => {
            let project: ProjectFile = read_json(&file)?;
            let project_path = file.display().to_string();
            let outcome = state
                .projects
                .run(&project_path, project.topics, &project.scenario_config, resume)
                .await?;
            print_json(&outcome)?;
        }
        Command::Checkpoints { status } => {
            let status = status
                .as_deref()
                .map(str::parse::<CheckpointStatus>)
                .transpose()
                .map_err(anyhow::Error::msg)?;
            let summaries = store.list_checkpoints(status).await?;
            print_json(&summaries)?;
        }
        Command::Audit {
            session_id,
            offset,
            limit,
        } => {
            let page = store
                .get_api_call_log_page(&session_id, offset, limit.max(1))
                .await?;
            print_json(&page)?;
        }
    }

    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Initialize tracing/logging. Always writes to stderr; stdout carries results.
fn init_logging(config: &Config) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Pretty => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}
