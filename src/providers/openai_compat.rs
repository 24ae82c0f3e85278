//! OpenAI-compatible provider
//!
//! Works with any API that implements the OpenAI chat completions format with
//! server-sent event streaming:
//! - Groq (api.groq.com)
//! - OpenRouter (openrouter.ai)
//! - OpenAI (api.openai.com)
//! - vLLM, LM Studio and other local servers
//!
//! # Configuration
//!
//! ```toml
//! [providers.groq]
//! wire = "openai"
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use super::{embedded_error, next_chunk, send_within, take_line, ChunkStream, CompletionProvider, CompletionRequest, ProviderChunk, ProviderError};

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
}

/// OpenAI-compatible provider configuration
#[derive(Debug, Clone)]
pub struct OpenAICompatConfig {
    /// Base URL for the API (e.g., https://api.groq.com/openai/v1)
    pub base_url: String,
    /// API key (optional for local servers)
    pub api_key: Option<String>,
}

/// OpenAI-compatible API provider
pub struct OpenAICompatProvider {
    config: OpenAICompatConfig,
    client: Client,
}

impl OpenAICompatProvider {
    /// Create a new provider with the given configuration
    pub fn new(config: OpenAICompatConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self { config, client })
    }

    fn body(request: &CompletionRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": request.stream,
        });

        if let Some(ref effort) = request.extras.reasoning_effort {
            body["reasoning"] = json!({
                "effort": effort,
                "exclude": false,
            });
        }

        body
    }

    /// Send the request, retrying transient failures up to `max_retries` times
    async fn send(&self, request: &CompletionRequest) -> Result<reqwest::Response, ProviderError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = Self::body(request);
        let max_retries = request.extras.max_retries.unwrap_or(0);
        let mut attempt = 0;

        loop {
            let mut req_builder = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&body);

            // Add authorization if API key is provided
            if let Some(ref api_key) = self.config.api_key {
                req_builder = req_builder.bearer_auth(api_key);
            }

            let result = match send_within(req_builder, request.timeout()).await {
                Ok(response) => Self::check_status(response).await,
                err => err,
            };

            match result {
                Err(e) if attempt < max_retries && is_transient(&e) => {
                    attempt += 1;
                    tracing::warn!("Attempt {} against {} failed, retrying: {}", attempt, url, e);
                    tokio::time::sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderError::Timeout(message),
            _ => ProviderError::InvalidResponse(format!("HTTP {}: {}", status, message)),
        })
    }
}

fn is_transient(err: &ProviderError) -> bool {
    match err {
        ProviderError::Timeout(_) => true,
        ProviderError::RequestFailed(e) => e.is_connect() || e.is_timeout(),
        ProviderError::InvalidResponse(message) => {
            message.starts_with("HTTP 429") || message.starts_with("HTTP 5")
        }
        _ => false,
    }
}

#[async_trait]
impl CompletionProvider for OpenAICompatProvider {
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        tracing::debug!("Opening completion stream for {} at {}", request.model, self.config.base_url);

        let response = self.send(&request).await?;
        let mut bytes = response.bytes_stream();
        let idle = request.timeout();

        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();

            'outer: while let Some(chunk) = next_chunk(&mut bytes, idle).await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);

                while let Some(line) = take_line(&mut buffer) {
                    // Comments, event names and blank separators carry nothing
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        break 'outer;
                    }

                    let value: Value = serde_json::from_str(data).map_err(|e| {
                        tracing::error!("Parsing completion chunk failed for {}\nError:{}", data, e);
                        ProviderError::InvalidResponse(format!("Malformed chunk: {}", e))
                    })?;
                    if let Some(err) = embedded_error(&value) {
                        Err::<(), _>(err)?;
                    }
                    yield ProviderChunk::Json(value);
                }
            }
        }))
    }
}
