use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Message in a reasoning conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

/// Message role
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// Request to run one reasoning pipe
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    /// Pipe name (selects model and system prompt on the service side)
    pub name: String,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub stream: bool,
    /// Tools the service may use for this call (e.g. "web_search")
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
}

/// Response from a reasoning pipe
#[derive(Debug, Clone, Deserialize)]
pub struct ReasoningResponse {
    pub success: bool,
    pub completion: String,
    pub raw: Option<RawResponse>,
    /// Tools the service actually invoked
    #[serde(default, rename = "toolsUsed")]
    pub tools_used: Vec<String>,
}

/// Raw model response details
#[derive(Debug, Clone, Deserialize)]
pub struct RawResponse {
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Token usage information
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Usage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
    pub reasoning_tokens: Option<u64>,
}

impl Message {
    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

impl ReasoningRequest {
    /// Create a new request with pipe name and messages
    pub fn new(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            name: name.into(),
            messages,
            stream: false,
            tools: Vec::new(),
            variables: None,
        }
    }

    /// Allow the service to use a tool
    pub fn with_tool(mut self, tool: impl Into<String>) -> Self {
        self.tools.push(tool.into());
        self
    }

    /// Add a single variable
    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// The user-visible prompt text, used for the audit log.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .filter(|m| matches!(m.role, MessageRole::User))
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

impl ReasoningResponse {
    /// Model reported by the service, if any.
    pub fn model(&self) -> Option<&str> {
        self.raw.as_ref().and_then(|r| r.model.as_deref())
    }

    /// Token usage, zero when the service did not report it.
    pub fn usage(&self) -> TokenUsage {
        let usage = self
            .raw
            .as_ref()
            .and_then(|r| r.usage.clone())
            .unwrap_or_default();
        TokenUsage {
            input_tokens: usage.prompt_tokens.unwrap_or(0),
            output_tokens: usage.completion_tokens.unwrap_or(0),
            reasoning_tokens: usage.reasoning_tokens.unwrap_or(0),
        }
    }
}

/// Normalized token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
}
