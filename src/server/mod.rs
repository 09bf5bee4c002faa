//! Server module for the JSON-RPC query surface.
//!
//! This module provides:
//! - MCP-style JSON-RPC server over stdio
//! - Tool call handlers for checkpoint introspection, resume and project runs
//! - Shared application state

mod handlers;
mod mcp;

pub use handlers::*;
pub use mcp::*;

use std::sync::Arc;

use crate::analysis::AnalysisRunner;
use crate::config::Config;
use crate::orchestrator::ProjectRunner;
use crate::reasoning::ReasoningService;
use crate::storage::SharedStore;

/// Application state shared across handlers.
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Checkpoint store.
    pub store: SharedStore,
    /// Single-session driver.
    pub analysis: Arc<AnalysisRunner>,
    /// Multi-topic driver, running topics through `analysis`.
    pub projects: ProjectRunner,
}

impl AppState {
    /// Create new application state
    pub fn new(config: Config, store: SharedStore, reasoning: Arc<dyn ReasoningService>) -> Self {
        tracing::info!(
            framing_pipe = %config.pipes.framing,
            evidence_pipe = %config.pipes.evidence,
            synthesis_pipe = %config.pipes.synthesis,
            budget_usd = ?config.budget.max_cost_usd,
            "AppState initializing"
        );

        let analysis = Arc::new(AnalysisRunner::new(reasoning, store.clone(), &config));
        let projects = ProjectRunner::new(store.clone(), analysis.clone());

        Self {
            config,
            store,
            analysis,
            projects,
        }
    }
}

/// Shared application state handle
pub type SharedState = Arc<AppState>;
