use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info};

use super::SharedState;
use crate::error::{McpError, McpResult};
use crate::orchestrator::Topic;
use crate::storage::{CheckpointStatus, CheckpointStore};

/// Default page size for `audit_log`.
pub const AUDIT_LOG_DEFAULT_LIMIT: u64 = 50;
/// Largest page `audit_log` will return.
pub const AUDIT_LOG_MAX_LIMIT: u64 = 500;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        // Session introspection
        "checkpoint_list" => handle_checkpoint_list(state, arguments).await,
        "checkpoint_get" => handle_checkpoint_get(state, arguments).await,
        "checkpoint_download" => handle_checkpoint_download(state, arguments).await,
        "audit_log" => handle_audit_log(state, arguments).await,
        "checkpoint_resume" => handle_checkpoint_resume(state, arguments).await,
        // Projects
        "project_run" => handle_project_run(state, arguments).await,
        "project_status" => handle_project_status(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    session_id: String,
}

/// Handle checkpoint_list - session summaries, newest first
async fn handle_checkpoint_list(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Debug, Default, Deserialize)]
    struct ListParams {
        status: Option<String>,
    }

    // All arguments are optional here.
    let params: ListParams = match arguments {
        Some(_) => parse_arguments("checkpoint_list", arguments)?,
        None => ListParams::default(),
    };

    let status = params
        .status
        .as_deref()
        .map(str::parse::<CheckpointStatus>)
        .transpose()
        .map_err(|message| McpError::InvalidParameters {
            tool_name: "checkpoint_list".to_string(),
            message,
        })?;

    let checkpoints = state
        .store
        .list_checkpoints(status)
        .await
        .map_err(execution_failed)?;

    Ok(json!({
        "count": checkpoints.len(),
        "checkpoints": checkpoints,
    }))
}

/// Handle checkpoint_get - full parsed snapshot
async fn handle_checkpoint_get(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("checkpoint_get", arguments)?;

    let snapshot = state
        .store
        .retrieve_checkpoint(&params.session_id)
        .await
        .map_err(execution_failed)?
        .ok_or_else(|| not_found(&params.session_id))?;

    serde_json::to_value(snapshot).map_err(McpError::Json)
}

/// Handle checkpoint_download - the stored snapshot document verbatim
async fn handle_checkpoint_download(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("checkpoint_download", arguments)?;

    let raw = state
        .store
        .retrieve_checkpoint_raw(&params.session_id)
        .await
        .map_err(execution_failed)?
        .ok_or_else(|| not_found(&params.session_id))?;

    Ok(json!({
        "session_id": params.session_id,
        "filename": format!("checkpoint_{}.json", params.session_id),
        "content_type": "application/json",
        "content": raw,
    }))
}

/// Handle audit_log - paged call records in append order
async fn handle_audit_log(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Debug, Deserialize)]
    struct AuditParams {
        session_id: String,
        #[serde(default)]
        offset: u64,
        #[serde(default = "default_limit")]
        limit: u64,
    }

    fn default_limit() -> u64 {
        AUDIT_LOG_DEFAULT_LIMIT
    }

    let params: AuditParams = parse_arguments("audit_log", arguments)?;
    let limit = params.limit.clamp(1, AUDIT_LOG_MAX_LIMIT);

    let page = state
        .store
        .get_api_call_log_page(&params.session_id, params.offset, limit)
        .await
        .map_err(execution_failed)?;

    serde_json::to_value(page).map_err(McpError::Json)
}

/// Handle checkpoint_resume - start a new session from a failed one
///
/// Returns as soon as the new session exists; the remaining phases run in a
/// background task.
async fn handle_checkpoint_resume(
    state: &SharedState,
    arguments: Option<Value>,
) -> McpResult<Value> {
    let params: SessionParams = parse_arguments("checkpoint_resume", arguments)?;

    let (checkpointer, resume_point) = state
        .analysis
        .prepare_resume(&params.session_id)
        .await
        .map_err(execution_failed)?;
    let new_session_id = checkpointer.session_id().to_string();

    let analysis = state.analysis.clone();
    let failed_session_id = params.session_id.clone();
    tokio::spawn(async move {
        let session_id = checkpointer.session_id().to_string();
        match analysis.run_session(checkpointer).await {
            Ok(result) => info!(
                session_id = %session_id,
                resumed_from = %failed_session_id,
                verdict = %result.verdict,
                "Resumed session completed"
            ),
            Err(e) => error!(
                session_id = %session_id,
                resumed_from = %failed_session_id,
                error = %e,
                "Resumed session failed"
            ),
        }
    });

    Ok(json!({
        "new_session_id": new_session_id,
        "resumed_from": params.session_id,
        "resume_point": resume_point,
    }))
}

/// Handle project_run - run every topic in dependency order
async fn handle_project_run(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Debug, Deserialize)]
    struct ProjectRunParams {
        project_path: String,
        topics: Vec<Topic>,
        #[serde(default)]
        scenario_config: Value,
        #[serde(default)]
        resume: bool,
    }

    let params: ProjectRunParams = parse_arguments("project_run", arguments)?;

    let outcome = state
        .projects
        .run(
            &params.project_path,
            params.topics,
            &params.scenario_config,
            params.resume,
        )
        .await
        .map_err(execution_failed)?;

    serde_json::to_value(outcome).map_err(McpError::Json)
}

/// Handle project_status - the persisted project checkpoint
async fn handle_project_status(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    #[derive(Debug, Deserialize)]
    struct StatusParams {
        project_path: String,
    }

    let params: StatusParams = parse_arguments("project_status", arguments)?;

    let project = state
        .store
        .retrieve_project_checkpoint(&params.project_path)
        .await
        .map_err(execution_failed)?
        .ok_or_else(|| McpError::ExecutionFailed {
            message: format!("No project checkpoint for '{}'", params.project_path),
        })?;

    serde_json::to_value(project).map_err(McpError::Json)
}

// ============================================================================
// Helper functions
// ============================================================================

/// Helper to parse arguments with consistent error handling
fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

fn execution_failed(e: impl std::fmt::Display) -> McpError {
    McpError::ExecutionFailed {
        message: e.to_string(),
    }
}

fn not_found(session_id: &str) -> McpError {
    McpError::ExecutionFailed {
        message: format!("Checkpoint not found: {}", session_id),
    }
}
