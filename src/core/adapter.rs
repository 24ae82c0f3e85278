//! Completion client adapter
//!
//! Sits between the chat session and a provider transport:
//! 1. Resolves the model and its provider from the catalog
//! 2. Checks the provider credential when constructed, before any request
//! 3. Fills in sampling defaults and the default system prompt
//! 4. Wraps every turn in the provider's prompt template
//! 5. Normalizes provider-native chunks into [`ResponseFragment`]s

use std::sync::Arc;

use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{CatalogEntry, Credentials, ModelCatalog, PromptTemplate, ProviderExtras};
use crate::conversation::{Message, Role};
use crate::providers::{self, CompletionProvider, CompletionRequest, ProviderChunk, ProviderError};

use super::error::ChatError;

pub type FragmentStream = BoxStream<'static, Result<ResponseFragment, ChatError>>;

/// Structured reasoning block sent by providers with a thinking channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    #[serde(default)]
    pub thinking: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// One incremental piece of a streamed response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseFragment {
    /// Visible text delta, may be empty
    pub content: String,

    /// Delta from a separate reasoning channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thinking_blocks: Vec<ThinkingBlock>,
}

impl ResponseFragment {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.thinking_blocks.iter().all(|b| b.thinking.is_empty())
    }

    /// Text from the structured reasoning channel, blocks included
    pub fn reasoning_text(&self) -> String {
        let mut text = self.reasoning.clone().unwrap_or_default();
        for block in &self.thinking_blocks {
            text.push_str(&block.thinking);
        }
        text
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// Convert a provider-native chunk into a fragment.
///
/// Returns `None` when the chunk carries no text, reasoning or thinking block.
pub fn normalize_chunk(chunk: ProviderChunk) -> Option<ResponseFragment> {
    let fragment = match chunk {
        ProviderChunk::Text(text) => ResponseFragment::text(text),
        ProviderChunk::Json(Value::String(text)) => ResponseFragment::text(text),
        ProviderChunk::Json(value) => normalize_value(&value),
    };

    if fragment.is_empty() {
        None
    } else {
        Some(fragment)
    }
}

fn normalize_value(value: &Value) -> ResponseFragment {
    let mut fragment = ResponseFragment::default();

    if let Some(choice) = value.get("choices").and_then(|c| c.get(0)) {
        if let Some(delta) = choice.get("delta") {
            let original = delta
                .get("provider_specific_fields")
                .and_then(|f| str_field(f, "original_content"));
            fragment.content = original
                .or_else(|| str_field(delta, "content"))
                .unwrap_or_default()
                .to_string();
            fragment.reasoning = str_field(delta, "reasoning_content")
                .or_else(|| str_field(delta, "reasoning"))
                .map(str::to_string);
            if let Some(blocks) = delta.get("thinking_blocks") {
                fragment.thinking_blocks = serde_json::from_value(blocks.clone()).unwrap_or_default();
            }
        } else if let Some(text) = str_field(choice, "text") {
            fragment.content = text.to_string();
        } else if let Some(text) = str_field(choice, "content") {
            fragment.content = text.to_string();
        } else if let Some(message) = choice.get("message") {
            fragment.content = str_field(message, "content").unwrap_or_default().to_string();
            fragment.reasoning = str_field(message, "reasoning_content").map(str::to_string);
        }
    } else if let Some(message) = value.get("message") {
        fragment.content = str_field(message, "content").unwrap_or_default().to_string();
        fragment.reasoning = str_field(message, "thinking").map(str::to_string);
    } else if let Some(text) = str_field(value, "content") {
        fragment.content = text.to_string();
    }

    fragment
}

/// Per-call sampling settings; unset values come from the model defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default)]
    pub temperature: Option<f32>,

    #[serde(default)]
    pub max_tokens: Option<u32>,

    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl GenerationSettings {
    pub fn validate(&self) -> Result<(), ChatError> {
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(ChatError::Configuration(format!(
                    "temperature must be within [0, 2], got {}",
                    t
                )));
            }
        }
        if self.max_tokens == Some(0) {
            return Err(ChatError::Configuration("max_tokens must be at least 1".into()));
        }
        Ok(())
    }
}

/// Adapter bound to one model
pub struct CompletionAdapter {
    model: CatalogEntry,
    template: PromptTemplate,
    extras: ProviderExtras,
    provider: Arc<dyn CompletionProvider>,
}

impl CompletionAdapter {
    /// Resolve `model_id` and build its provider transport.
    ///
    /// Fails before any network traffic when the model is unknown, the provider
    /// has no endpoint, or the provider's credential is absent.
    pub fn new(model_id: &str, catalog: &ModelCatalog, credentials: &Credentials) -> Result<Self, ChatError> {
        let model = catalog.model(model_id)?;
        let settings = catalog.provider(&model.provider)?;

        let api_key = match settings.api_key_env {
            Some(ref env_var) => Some(
                credentials
                    .get(env_var)
                    .ok_or_else(|| ChatError::MissingCredential {
                        provider: model.provider.clone(),
                        env_var: env_var.clone(),
                    })?
                    .to_string(),
            ),
            None => None,
        };

        let provider = providers::from_settings(&model.provider, settings, api_key)
            .map_err(|e| ChatError::Configuration(e.to_string()))?;

        tracing::debug!("Adapter ready for {} via {}", model.id, model.provider);

        Ok(Self::with_provider(
            model,
            settings.template.clone(),
            settings.extras.clone(),
            provider,
        ))
    }

    /// Build an adapter around an existing transport
    pub fn with_provider(
        model: CatalogEntry,
        template: PromptTemplate,
        extras: ProviderExtras,
        provider: Arc<dyn CompletionProvider>,
    ) -> Self {
        Self {
            model,
            template,
            extras,
            provider,
        }
    }

    pub fn model(&self) -> &CatalogEntry {
        &self.model
    }

    /// Default system prompt for the model, if it gets one
    pub fn default_system_prompt(&self) -> Option<&'static str> {
        match self.model.spec.model_type {
            Some(kind) => Some(kind.default_system_prompt()),
            None if self.model.spec.is_instruction => {
                Some(crate::config::PromptKind::Instruction.default_system_prompt())
            }
            None => None,
        }
    }

    /// Wrap the history in the provider template.
    ///
    /// The system prompt is resolved as: explicit setting, then a system
    /// message stored in the history, then the model default.
    pub fn format_messages(&self, messages: &[Message], system_prompt: Option<&str>) -> Vec<Message> {
        let stored_system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str());
        let system_prompt = system_prompt
            .or(stored_system)
            .or_else(|| self.default_system_prompt());

        let mut formatted = Vec::with_capacity(messages.len() + 1);
        if let Some(prompt) = system_prompt {
            formatted.push(Message::system(self.template.apply(Role::System, prompt)));
        }
        formatted.extend(
            messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| Message::new(m.role, self.template.apply(m.role, &m.content))),
        );
        formatted
    }

    /// Build the provider request for a history
    pub fn build_request(&self, messages: &[Message], settings: &GenerationSettings) -> CompletionRequest {
        CompletionRequest {
            model: self.model.wire_model_id().to_string(),
            messages: self.format_messages(messages, settings.system_prompt.as_deref()),
            temperature: settings
                .temperature
                .unwrap_or(self.model.spec.default_temperature),
            max_tokens: settings
                .max_tokens
                .unwrap_or(self.model.spec.default_max_tokens),
            stream: true,
            extras: self.extras.clone(),
        }
    }

    /// Stream a response for `messages`.
    ///
    /// Nothing is sent until the stream is first polled. Provider failures,
    /// whether opening the stream or midway through it, are reported as
    /// [`ChatError::Generation`] and end the stream.
    pub fn generate(&self, messages: &[Message], settings: &GenerationSettings) -> FragmentStream {
        let request = self.build_request(messages, settings);
        let provider = Arc::clone(&self.provider);
        let provider_name = self.model.provider.clone();
        let model_id = self.model.id.clone();
        let validation = settings.validate();

        Box::pin(async_stream::try_stream! {
            validation?;

            let wrap = |source: ProviderError| ChatError::Generation {
                provider: provider_name.clone(),
                model: model_id.clone(),
                source,
            };

            tracing::debug!(
                "Generating with {} (temperature {}, max_tokens {})",
                model_id,
                request.temperature,
                request.max_tokens
            );

            let mut chunks = provider.stream(request).await.map_err(wrap)?;
            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(wrap)?;
                if let Some(fragment) = normalize_chunk(chunk) {
                    yield fragment;
                }
            }
        })
    }
}
