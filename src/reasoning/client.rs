use async_trait::async_trait;
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::types::{ReasoningRequest, ReasoningResponse};
use super::ReasoningService;
use crate::config::{ReasoningConfig, RequestConfig};
use crate::error::{ReasoningError, ReasoningResult};

/// HTTP client for the external reasoning service
#[derive(Clone)]
pub struct ReasoningClient {
    client: Client,
    base_url: String,
    api_key: String,
    timeout_ms: u64,
}

impl ReasoningClient {
    /// Create a new reasoning client
    pub fn new(config: &ReasoningConfig, request_config: &RequestConfig) -> ReasoningResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(request_config.timeout_ms))
            .build()
            .map_err(ReasoningError::Http)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            timeout_ms: request_config.timeout_ms,
        })
    }

    /// Get the base URL (for testing)
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn execute_request(
        &self,
        request: &ReasoningRequest,
    ) -> ReasoningResult<ReasoningResponse> {
        let url = format!("{}/v1/pipes/run", self.base_url);

        debug!(
            pipe = %request.name,
            messages = request.messages.len(),
            tools = ?request.tools,
            "Calling reasoning pipe"
        );

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ReasoningError::Timeout {
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    ReasoningError::Http(e)
                }
            })?;

        let status = response.status();

        if !status.is_success() {
            let error_body = response.text().await.unwrap_or_default();
            return Err(ReasoningError::Api {
                status: status.as_u16(),
                message: error_body,
            });
        }

        let parsed: ReasoningResponse = response.json().await.map_err(|e| {
            ReasoningError::InvalidResponse {
                message: format!("Failed to parse response: {}", e),
            }
        })?;

        if !parsed.success {
            return Err(ReasoningError::InvalidResponse {
                message: "service reported success=false".to_string(),
            });
        }

        Ok(parsed)
    }
}

#[async_trait]
impl ReasoningService for ReasoningClient {
    async fn reason(&self, request: &ReasoningRequest) -> ReasoningResult<ReasoningResponse> {
        let start = Instant::now();
        match self.execute_request(request).await {
            Ok(response) => {
                info!(
                    pipe = %request.name,
                    latency_ms = start.elapsed().as_millis(),
                    "Reasoning call succeeded"
                );
                Ok(response)
            }
            Err(e) => {
                warn!(
                    pipe = %request.name,
                    error = %e,
                    latency_ms = start.elapsed().as_millis(),
                    "Reasoning call failed"
                );
                Err(e)
            }
        }
    }
}
