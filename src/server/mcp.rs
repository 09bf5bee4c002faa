//! JSON-RPC 2.0 over stdio, MCP-style.
//!
//! One request per line in, one response per line out. Notifications
//! (requests without an id) never get a response.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, error, info};

use super::{handle_tool_call, SharedState};

#[cfg(test)]
#[path = "mcp_tests.rs"]
mod mcp_tests;

/// MCP protocol revision advertised in `initialize`.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub const PARSE_ERROR: i32 = -32700;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

/// JSON-RPC 2.0 request. `id` is absent for notifications.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response. Exactly one of `result` and `error` is set.
#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Null when the request id could not be determined.
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct Capabilities {
    pub tools: ToolCapabilities,
}

#[derive(Debug, Serialize)]
pub struct ToolCapabilities {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

/// Result of the `initialize` handshake.
#[derive(Debug, Serialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: Capabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

/// Tool definition with its JSON Schema.
#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Parameters of a `tools/call` request.
#[derive(Debug, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ToolResultContent {
    #[serde(rename = "type")]
    pub content_type: String,
    pub text: String,
}

/// Result of a tool invocation. Tool failures are reported here with
/// `isError`, not as JSON-RPC errors.
#[derive(Debug, Serialize)]
pub struct ToolCallResult {
    pub content: Vec<ToolResultContent>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl JsonRpcResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: id.unwrap_or(Value::Null),
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

impl ToolResultContent {
    fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: "text".to_string(),
            text: text.into(),
        }
    }
}

/// Line-delimited JSON-RPC server over the shared application state.
pub struct McpServer {
    state: SharedState,
}

impl McpServer {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }

    /// Serve stdin/stdout until EOF.
    pub async fn run(&self) -> std::io::Result<()> {
        info!("Analysis query server starting");
        let stdin = BufReader::new(tokio::io::stdin());
        let stdout = tokio::io::stdout();
        self.serve(stdin, stdout).await
    }

    /// Serve any line-oriented reader/writer pair until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("EOF received, shutting down");
                break;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(request = %trimmed, "Received request");

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle_request(request).await,
                Err(e) => {
                    error!(error = %e, "Failed to parse request");
                    Some(JsonRpcResponse::error(
                        None,
                        PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                let response_json = serde_json::to_string(&response)?;
                debug!(response = %response_json, "Sending response");

                writer.write_all(response_json.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await?;
            }
        }

        Ok(())
    }

    /// Dispatch one request. `None` means no response is sent.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let is_notification = request.id.is_none();

        match request.method.as_str() {
            "initialize" => Some(initialize_response(request.id)),
            "initialized" | "notifications/initialized" | "notifications/cancelled" => {
                debug!(method = %request.method, "Notification received");
                None
            }
            "tools/list" => Some(JsonRpcResponse::success(
                request.id,
                serde_json::json!({ "tools": tool_definitions() }),
            )),
            "tools/call" => Some(self.handle_tool_call(request.id, request.params).await),
            "ping" => Some(JsonRpcResponse::success(
                request.id,
                Value::Object(Default::default()),
            )),
            method if is_notification => {
                debug!(method = %method, "Unknown notification, ignoring");
                None
            }
            method => {
                error!(method = %method, "Unknown method");
                Some(JsonRpcResponse::error(
                    request.id,
                    METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                ))
            }
        }
    }

    async fn handle_tool_call(&self, id: Option<Value>, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params.map(serde_json::from_value) {
            Some(Ok(p)) => p,
            Some(Err(e)) => {
                return JsonRpcResponse::error(id, INVALID_PARAMS, format!("Invalid params: {}", e))
            }
            None => return JsonRpcResponse::error(id, INVALID_PARAMS, "Missing params"),
        };

        info!(tool = %params.name, "Handling tool call");

        let tool_result = match handle_tool_call(&self.state, &params.name, params.arguments).await
        {
            Ok(result) => match serde_json::to_string_pretty(&result) {
                Ok(text) => ToolCallResult {
                    content: vec![ToolResultContent::text(text)],
                    is_error: None,
                },
                Err(e) => {
                    error!(error = %e, "Failed to serialize tool result");
                    return JsonRpcResponse::error(
                        id,
                        INTERNAL_ERROR,
                        format!("Internal error: {}", e),
                    );
                }
            },
            Err(e) => {
                info!(tool = %params.name, error = %e, "Tool call failed");
                ToolCallResult {
                    content: vec![ToolResultContent::text(format!("Error: {}", e))],
                    is_error: Some(true),
                }
            }
        };

        match serde_json::to_value(tool_result) {
            Ok(val) => JsonRpcResponse::success(id, val),
            Err(e) => JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e)),
        }
    }
}

fn initialize_response(id: Option<Value>) -> JsonRpcResponse {
    info!("Handling initialize request");

    let result = InitializeResult {
        protocol_version: PROTOCOL_VERSION.to_string(),
        capabilities: Capabilities {
            tools: ToolCapabilities {
                list_changed: false,
            },
        },
        server_info: ServerInfo {
            name: "resumable-analysis".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
    };

    match serde_json::to_value(result) {
        Ok(val) => JsonRpcResponse::success(id, val),
        Err(e) => {
            error!(error = %e, "Failed to serialize initialize result");
            JsonRpcResponse::error(id, INTERNAL_ERROR, format!("Internal error: {}", e))
        }
    }
}

/// Every tool this server exposes.
pub fn tool_definitions() -> Vec<Tool> {
    vec![
        get_checkpoint_list_tool(),
        get_checkpoint_get_tool(),
        get_checkpoint_download_tool(),
        get_audit_log_tool(),
        get_checkpoint_resume_tool(),
        get_project_run_tool(),
        get_project_status_tool(),
    ]
}

fn session_id_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "session_id": {
                "type": "string",
                "description": "Analysis session id"
            }
        },
        "required": ["session_id"]
    })
}

fn get_checkpoint_list_tool() -> Tool {
    Tool {
        name: "checkpoint_list".to_string(),
        description: "List analysis sessions, newest first, with status, call count, cost and resume point.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "status": {
                    "type": "string",
                    "enum": ["in_progress", "completed", "failed"],
                    "description": "Only list sessions with this status"
                }
            }
        }),
    }
}

fn get_checkpoint_get_tool() -> Tool {
    Tool {
        name: "checkpoint_get".to_string(),
        description: "Get the full checkpoint of one session: completed phases, fan-out progress, cost totals and error.".to_string(),
        input_schema: session_id_schema(),
    }
}

fn get_checkpoint_download_tool() -> Tool {
    Tool {
        name: "checkpoint_download".to_string(),
        description: "Download the stored checkpoint document of one session verbatim.".to_string(),
        input_schema: session_id_schema(),
    }
}

fn get_audit_log_tool() -> Tool {
    Tool {
        name: "audit_log".to_string(),
        description: "Page through the per-call audit log of one session in append order.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "session_id": {
                    "type": "string",
                    "description": "Analysis session id"
                },
                "offset": {
                    "type": "integer",
                    "minimum": 0,
                    "description": "Records to skip (default 0)"
                },
                "limit": {
                    "type": "integer",
                    "minimum": 1,
                    "maximum": 500,
                    "description": "Page size (default 50, max 500)"
                }
            },
            "required": ["session_id"]
        }),
    }
}

fn get_checkpoint_resume_tool() -> Tool {
    Tool {
        name: "checkpoint_resume".to_string(),
        description: "Resume a failed session. Creates a new session that reuses completed phases and continues in the background.".to_string(),
        input_schema: session_id_schema(),
    }
}

fn get_project_run_tool() -> Tool {
    Tool {
        name: "project_run".to_string(),
        description: "Run a set of dependent topics in dependency order, checkpointing the project after each completed topic.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "project_path": {
                    "type": "string",
                    "description": "Key under which project progress is stored"
                },
                "topics": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "id": {"type": "string"},
                            "proposition": {"type": "string"},
                            "depends_on": {"type": "array", "items": {"type": "string"}},
                            "context_from_prior": {"type": "boolean"},
                            "scenario_config": {"type": "object"}
                        },
                        "required": ["id", "proposition"]
                    }
                },
                "scenario_config": {
                    "type": "object",
                    "description": "Hypotheses, paradigms with priors, and evidence queries used by topics without their own"
                },
                "resume": {
                    "type": "boolean",
                    "description": "Skip topics already completed in the stored project checkpoint"
                }
            },
            "required": ["project_path", "topics"]
        }),
    }
}

fn get_project_status_tool() -> Tool {
    Tool {
        name: "project_status".to_string(),
        description: "Get the stored project checkpoint: completed topics and their results.".to_string(),
        input_schema: serde_json::json!({
            "type": "object",
            "properties": {
                "project_path": {
                    "type": "string",
                    "description": "Project key used with project_run"
                }
            },
            "required": ["project_path"]
        }),
    }
}
