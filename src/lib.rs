//! # Resumable Analysis
//!
//! Checkpointed analysis pipelines over an external reasoning service.
//!
//! ## Features
//!
//! - **Audit log**: every external call is appended as one record, durable before it counts
//! - **Phase snapshots**: completed phases and fan-out progress survive crashes
//! - **Resume**: a failed session continues in a new session from its first incomplete phase
//! - **Posterior aggregation**: log-space Bayesian combination per paradigm, resumable per cluster
//! - **Projects**: dependent topics run in dependency order with context from prior results
//!
//! ## Architecture
//!
//! ```text
//! CLI / JSON-RPC → ProjectRunner → AnalysisRunner → ReasoningService (HTTP)
//!                                        ↓
//!                              AnalysisCheckpointer → SQLite
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use resumable_analysis::{AppState, Config};
//! use resumable_analysis::reasoning::ReasoningClient;
//! use resumable_analysis::storage::SqliteStorage;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let store = Arc::new(SqliteStorage::new(&config.database).await?);
//!     let client = ReasoningClient::new(&config.reasoning, &config.request)?;
//!     let state = AppState::new(config, store, Arc::new(client));
//!     let result = state.analysis.start("default", "Coffee improves focus", scenario).await?;
//!     println!("{}", result.verdict);
//!     Ok(())
//! }
//! ```

/// Single-session phase driver.
pub mod analysis;
/// Per-session checkpoint state machine.
pub mod checkpoint;
/// Configuration loaded from the environment.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Dependency-ordered multi-topic execution.
pub mod orchestrator;
/// Bayesian posterior aggregation.
pub mod posterior;
/// System prompts for the phase pipes.
pub mod prompts;
/// External reasoning service interface and HTTP client.
pub mod reasoning;
/// JSON-RPC query surface.
pub mod server;
/// Checkpoint store and persisted types.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{AppState, McpServer, SharedState};
