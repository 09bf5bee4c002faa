use thiserror::Error;

use crate::orchestrator::TopicIssue;

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Reasoning service error: {0}")]
    Reasoning(#[from] ReasoningError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Posterior error: {0}")]
    Posterior(#[from] PosteriorError),

    #[error("{0}")]
    ConfigValidation(#[from] ConfigValidationError),

    #[error("Phase '{phase}' failed: {message}")]
    PhaseFailure { phase: String, message: String },

    #[error("Cost budget exceeded: spent ${spent:.4} of ${limit:.4}")]
    BudgetExceeded { spent: f64, limit: f64 },

    #[error("MCP protocol error: {0}")]
    Mcp(#[from] McpError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Storage layer errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database connection failed: {message}")]
    Connection { message: String },

    #[error("Query failed: {message}")]
    Query { message: String },

    #[error("Checkpoint not found: {session_id}")]
    CheckpointNotFound { session_id: String },

    #[error("Migration failed: {message}")]
    Migration { message: String },

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Reasoning service errors
#[derive(Debug, Error)]
pub enum ReasoningError {
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Invalid response: {message}")]
    InvalidResponse { message: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Session state machine errors
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Session {session_id} is {status} and can no longer be modified")]
    SessionTerminal { session_id: String, status: String },

    #[error("Session {session_id} is {status}; only failed sessions can be resumed")]
    NotResumable { session_id: String, status: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Posterior aggregation errors
#[derive(Debug, Error)]
pub enum PosteriorError {
    #[error("Invalid prior for paradigm '{paradigm}': {reason}")]
    InvalidPrior { paradigm: String, reason: String },

    #[error("Invalid likelihood in cluster '{cluster}' for {paradigm}/{hypothesis}: {value}")]
    InvalidLikelihood {
        cluster: String,
        paradigm: String,
        hypothesis: String,
        value: f64,
    },

    #[error("Cluster '{cluster}' has no likelihood for {paradigm}/{hypothesis}")]
    MissingLikelihood {
        cluster: String,
        paradigm: String,
        hypothesis: String,
    },

    #[error("Unknown paradigm '{paradigm}' in cluster '{cluster}'")]
    UnknownParadigm { cluster: String, paradigm: String },

    #[error("Invalid hypothesis set: {reason}")]
    InvalidHypotheses { reason: String },

    #[error("All hypotheses eliminated for paradigm '{paradigm}'")]
    Degenerate { paradigm: String },
}

/// Topic graph validation failure carrying every issue found.
#[derive(Debug, Error)]
#[error("Invalid project configuration ({} issue(s)): {}", .issues.len(), render_issues(.issues))]
pub struct ConfigValidationError {
    pub issues: Vec<TopicIssue>,
}

fn render_issues(issues: &[TopicIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// MCP protocol errors
#[derive(Debug, Error)]
pub enum McpError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Unknown tool: {tool_name}")]
    UnknownTool { tool_name: String },

    #[error("Invalid parameters for {tool_name}: {message}")]
    InvalidParameters { tool_name: String, message: String },

    #[error("Tool execution failed: {message}")]
    ExecutionFailed { message: String },

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<AppError> for McpError {
    fn from(err: AppError) -> Self {
        McpError::ExecutionFailed {
            message: err.to_string(),
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type alias for reasoning service calls
pub type ReasoningResult<T> = Result<T, ReasoningError>;

/// Result type alias for checkpointer operations
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Result type alias for posterior aggregation
pub type PosteriorResult<T> = Result<T, PosteriorError>;

/// Result type alias for MCP operations
pub type McpResult<T> = Result<T, McpError>;
