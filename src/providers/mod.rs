//! AI provider integrations
//!
//! Providers only speak their wire protocol: they take an already formatted
//! request and hand back the provider-native chunks unchanged. Turning those
//! chunks into fragments is the adapter's job.

mod ollama;
mod openai_compat;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::config::{ProviderExtras, ProviderSettings, WireFormat};
use crate::conversation::Message;

pub use ollama::OllamaProvider;
pub use openai_compat::{OpenAICompatConfig, OpenAICompatProvider};

/// Stall timeout used when the provider settings don't name one
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Authentication rejected: {0}")]
    Unauthorized(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// A chunk exactly as the provider produced it
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderChunk {
    Json(Value),
    Text(String),
}

pub type ChunkStream = BoxStream<'static, Result<ProviderChunk, ProviderError>>;

/// Streaming completion request
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub stream: bool,
    #[serde(skip)]
    pub extras: ProviderExtras,
}

impl CompletionRequest {
    /// How long the provider may stay silent, either before answering or
    /// between two body chunks. The stream as a whole is not bounded.
    pub fn timeout(&self) -> Duration {
        self.extras
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_TIMEOUT)
    }
}

/// A hosted model backend
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Open a completion stream
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError>;
}

/// Build the transport for a catalogued provider
pub fn from_settings(
    name: &str,
    settings: &ProviderSettings,
    api_key: Option<String>,
) -> Result<Arc<dyn CompletionProvider>, ProviderError> {
    let base_url = settings
        .base_url
        .clone()
        .ok_or_else(|| ProviderError::NotConfigured(format!("no base_url set for provider {}", name)))?;

    let provider: Arc<dyn CompletionProvider> = match settings.wire {
        WireFormat::OpenAi => Arc::new(OpenAICompatProvider::new(OpenAICompatConfig {
            base_url,
            api_key,
        })?),
        WireFormat::Ollama => Arc::new(OllamaProvider::new(base_url)?),
    };
    Ok(provider)
}

/// Pop the next complete line out of a byte buffer.
///
/// Network chunks can split both lines and multi-byte characters, so bytes
/// stay buffered until a newline arrives.
pub(crate) fn take_line(buffer: &mut Vec<u8>) -> Option<String> {
    let end = buffer.iter().position(|b| *b == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=end).collect();
    Some(String::from_utf8_lossy(&line).trim_end_matches(['\r', '\n']).to_string())
}

pub(crate) fn transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(err.to_string())
    } else {
        ProviderError::RequestFailed(err)
    }
}

/// Send a request, giving up if no response head arrives within `idle`
pub(crate) async fn send_within(
    builder: reqwest::RequestBuilder,
    idle: Duration,
) -> Result<reqwest::Response, ProviderError> {
    match tokio::time::timeout(idle, builder.send()).await {
        Ok(result) => result.map_err(transport_error),
        Err(_) => Err(ProviderError::Timeout(format!(
            "no response within {}s",
            idle.as_secs_f32()
        ))),
    }
}

/// Next body chunk, or a timeout error if the provider stalls for `idle`
pub(crate) async fn next_chunk<S, T>(body: &mut S, idle: Duration) -> Option<Result<T, ProviderError>>
where
    S: Stream<Item = reqwest::Result<T>> + Unpin,
{
    match tokio::time::timeout(idle, body.next()).await {
        Ok(chunk) => chunk.map(|c| c.map_err(transport_error)),
        Err(_) => Some(Err(ProviderError::Timeout(format!(
            "stream stalled for {}s",
            idle.as_secs_f32()
        )))),
    }
}

/// Turn a JSON error payload embedded in a stream into an error
pub(crate) fn embedded_error(value: &Value) -> Option<ProviderError> {
    let error = value.get("error")?;
    let message = error
        .get("message")
        .and_then(Value::as_str)
        .or_else(|| error.as_str())
        .unwrap_or("unknown provider error");
    Some(ProviderError::InvalidResponse(format!("API error: {}", message)))
}
