//! Ollama provider implementation

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::conversation::Message;

use super::{embedded_error, next_chunk, send_within, take_line, ChunkStream, CompletionProvider, CompletionRequest, ProviderChunk, ProviderError};

pub struct OllamaProvider {
    client: Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

impl OllamaProvider {
    pub fn new(base_url: String) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl CompletionProvider for OllamaProvider {
    async fn stream(&self, request: CompletionRequest) -> Result<ChunkStream, ProviderError> {
        let body = OllamaRequest {
            model: &request.model,
            messages: &request.messages,
            stream: request.stream,
            options: OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            },
        };

        let idle = request.timeout();
        let builder = self
            .client
            .post(format!("{}/api/chat", self.base_url.trim_end_matches('/')))
            .json(&body);
        let response = send_within(builder, idle).await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::InvalidResponse(format!(
                "{}: {}",
                status, body
            )));
        }

        let mut bytes = response.bytes_stream();

        // One JSON object per line, the last one carries `"done": true`
        Ok(Box::pin(async_stream::try_stream! {
            let mut buffer: Vec<u8> = Vec::new();

            'outer: while let Some(chunk) = next_chunk(&mut bytes, idle).await {
                let chunk = chunk?;
                buffer.extend_from_slice(&chunk);

                while let Some(line) = take_line(&mut buffer) {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(&line)
                        .map_err(|e| ProviderError::InvalidResponse(format!("Malformed chunk: {}", e)))?;
                    if let Some(err) = embedded_error(&value) {
                        Err::<(), _>(err)?;
                    }
                    let done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
                    yield ProviderChunk::Json(value);
                    if done {
                        break 'outer;
                    }
                }
            }
        }))
    }
}
