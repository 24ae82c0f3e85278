//! Model catalog
//!
//! Static mapping of provider → company → model id → model settings, plus the
//! per-provider transport settings and prompt template. The built-in catalog
//! can be extended or overridden from a TOML file:
//!
//! ```toml
//! [providers.groq]
//! wire = "openai"
//! base_url = "https://api.groq.com/openai/v1"
//! api_key_env = "GROQ_API_KEY"
//!
//! [models.groq.meta."groq/llama-3.1-8b-instant"]
//! name = "LLaMA 3.1 8B Instant"
//! context_length = 128000
//! default_temperature = 0.7
//! default_max_tokens = 2048
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use super::prompts::{builtin, PromptKind, PromptTemplate};

/// Wire protocol spoken by a provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// OpenAI-compatible `/chat/completions` with SSE streaming
    OpenAi,
    /// Ollama `/api/chat` with NDJSON streaming
    Ollama,
}

/// Provider-specific request extras
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderExtras {
    /// Attempts made to open the stream after the first one fails
    #[serde(default)]
    pub max_retries: Option<u32>,

    /// Request timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Reasoning effort hint for providers with a separate reasoning channel
    #[serde(default)]
    pub reasoning_effort: Option<String>,
}

/// Transport settings for one provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(default = "default_wire")]
    pub wire: WireFormat,

    /// Base URL of the API; required before a client can be built
    #[serde(default)]
    pub base_url: Option<String>,

    /// Environment variable holding the API key (None for keyless local servers)
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default)]
    pub template: PromptTemplate,

    #[serde(default)]
    pub extras: ProviderExtras,
}

fn default_wire() -> WireFormat {
    WireFormat::OpenAi
}

/// Settings of a single model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Display name
    pub name: String,

    pub context_length: usize,

    #[serde(default = "default_temperature")]
    pub default_temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub default_max_tokens: u32,

    /// Instruction-tuned models get the instruction system prompt by default
    #[serde(default = "default_true")]
    pub is_instruction: bool,

    /// Explicit default system prompt kind, takes precedence over `is_instruction`
    #[serde(default)]
    pub model_type: Option<PromptKind>,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_true() -> bool {
    true
}

/// A model together with where it sits in the catalog
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub provider: String,
    pub company: String,
    #[serde(flatten)]
    pub spec: ModelSpec,
}

impl CatalogEntry {
    /// Model id as the provider API expects it.
    ///
    /// Catalog ids may carry a `provider/` routing prefix (`groq/qwen-qwq-32b`)
    /// that the provider itself does not know about.
    pub fn wire_model_id(&self) -> &str {
        self.id
            .strip_prefix(&self.provider)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(&self.id)
    }
}

type ModelTable = BTreeMap<String, BTreeMap<String, BTreeMap<String, ModelSpec>>>;

/// Read-only model catalog
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelCatalog {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSettings>,

    /// provider → company → model id → spec
    #[serde(default)]
    pub models: ModelTable,
}

impl ModelCatalog {
    /// Load a catalog from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load a catalog from a TOML string
    pub fn from_str(content: &str) -> Result<Self, CatalogError> {
        let catalog: ModelCatalog = toml::from_str(content)?;
        catalog.validate()?;
        Ok(catalog)
    }

    /// Overlay another catalog on top of this one.
    ///
    /// Provider settings are replaced wholesale; models are added or replaced
    /// one by one.
    pub fn merge(mut self, other: ModelCatalog) -> Result<Self, CatalogError> {
        self.providers.extend(other.providers);
        for (provider, companies) in other.models {
            let target = self.models.entry(provider).or_default();
            for (company, models) in companies {
                target.entry(company).or_default().extend(models);
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Check that model ids are unique and every model has a provider
    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashSet::new();
        for (provider, companies) in &self.models {
            if !self.providers.contains_key(provider) {
                return Err(CatalogError::Validation(format!(
                    "models listed under unknown provider '{}'",
                    provider
                )));
            }
            for (id, spec) in companies.values().flat_map(|models| models.iter()) {
                if !seen.insert(id.as_str()) {
                    return Err(CatalogError::Validation(format!(
                        "model id '{}' is listed more than once",
                        id
                    )));
                }
                if spec.context_length == 0 || spec.default_max_tokens == 0 {
                    return Err(CatalogError::Validation(format!(
                        "model '{}' needs a non-zero context length and max tokens",
                        id
                    )));
                }
                if !(0.0..=2.0).contains(&spec.default_temperature) {
                    return Err(CatalogError::Validation(format!(
                        "model '{}' default temperature must be within [0, 2]",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Look up a model by id
    pub fn model(&self, id: &str) -> Result<CatalogEntry, CatalogError> {
        self.entries()
            .find(|entry| entry.id == id)
            .ok_or_else(|| CatalogError::UnknownModel(id.to_string()))
    }

    /// Look up the settings of a provider
    pub fn provider(&self, name: &str) -> Result<&ProviderSettings, CatalogError> {
        self.providers
            .get(name)
            .ok_or_else(|| CatalogError::UnknownProvider(name.to_string()))
    }

    /// All models in catalog order
    pub fn entries(&self) -> impl Iterator<Item = CatalogEntry> + '_ {
        self.models.iter().flat_map(|(provider, companies)| {
            companies.iter().flat_map(move |(company, models)| {
                models.iter().map(move |(id, spec)| CatalogEntry {
                    id: id.clone(),
                    provider: provider.clone(),
                    company: company.clone(),
                    spec: spec.clone(),
                })
            })
        })
    }

    /// Built-in catalog
    pub fn builtin() -> Self {
        let mut providers = BTreeMap::new();
        providers.insert(
            "groq".to_string(),
            ProviderSettings {
                wire: WireFormat::OpenAi,
                base_url: Some("https://api.groq.com/openai/v1".to_string()),
                api_key_env: Some("GROQ_API_KEY".to_string()),
                template: builtin::human_assistant(),
                extras: ProviderExtras::default(),
            },
        );
        providers.insert(
            "replicate".to_string(),
            ProviderSettings {
                wire: WireFormat::OpenAi,
                // No public OpenAI-compatible endpoint; set one in the catalog file
                base_url: None,
                api_key_env: Some("REPLICATE_API_KEY".to_string()),
                template: builtin::llama_instruct(),
                extras: ProviderExtras {
                    max_retries: Some(3),
                    timeout_secs: Some(120),
                    ..Default::default()
                },
            },
        );
        providers.insert(
            "openrouter".to_string(),
            ProviderSettings {
                wire: WireFormat::OpenAi,
                base_url: Some("https://openrouter.ai/api/v1".to_string()),
                api_key_env: Some("OPENROUTER_API_KEY".to_string()),
                template: builtin::passthrough(),
                extras: ProviderExtras {
                    reasoning_effort: Some("high".to_string()),
                    ..Default::default()
                },
            },
        );
        providers.insert(
            "ollama".to_string(),
            ProviderSettings {
                wire: WireFormat::Ollama,
                base_url: Some("http://localhost:11434".to_string()),
                api_key_env: None,
                template: builtin::passthrough(),
                extras: ProviderExtras {
                    timeout_secs: Some(300),
                    ..Default::default()
                },
            },
        );

        let mut models = ModelTable::new();
        let mut add = |provider: &str, company: &str, id: &str, name: &str, context_length: usize, max_tokens: u32| {
            models
                .entry(provider.to_string())
                .or_default()
                .entry(company.to_string())
                .or_default()
                .insert(
                    id.to_string(),
                    ModelSpec {
                        name: name.to_string(),
                        context_length,
                        default_temperature: 0.7,
                        default_max_tokens: max_tokens,
                        is_instruction: true,
                        model_type: None,
                    },
                );
        };

        add("groq", "alibaba", "groq/qwen-qwq-32b", "Qwen QWQ 32B", 128_000, 2048);
        add("groq", "mistral", "groq/mistral-saba-24b", "Mistral Saba 24B", 32_000, 2048);
        add(
            "groq",
            "deepseek",
            "groq/deepseek-r1-distill-qwen-32b",
            "DeepSeek R1 Distill Qwen 32B",
            128_000,
            16_384,
        );
        add(
            "groq",
            "deepseek",
            "groq/deepseek-r1-distill-llama-70b",
            "DeepSeek R1 Distill LLaMA 70B",
            128_000,
            2048,
        );
        add("groq", "meta", "groq/llama-3.3-70b-specdec", "LLaMA 3.3 70B SpecDec", 8192, 2048);
        add("replicate", "deepseek", "deepseek-ai/deepseek-r1", "DeepSeek R1", 128_000, 2048);
        add("openrouter", "deepseek", "openrouter/deepseek/deepseek-r1", "DeepSeek R1 (OpenRouter)", 128_000, 4096);
        add("ollama", "meta", "ollama/llama3.2", "LLaMA 3.2 (local)", 128_000, 2048);

        Self { providers, models }
    }
}

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Model {0} not found in configuration")]
    UnknownModel(String),

    #[error("Provider {0} not found in configuration")]
    UnknownProvider(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CATALOG: &str = r#"
[providers.local]
wire = "ollama"
base_url = "http://127.0.0.1:11434"

[providers.local.template.user]
pre_message = "Q: "

[providers.groq]
base_url = "https://api.groq.com/openai/v1"
api_key_env = "GROQ_API_KEY"

[providers.groq.extras]
max_retries = 2

[models.local.meta."local/llama3.2"]
name = "LLaMA 3.2"
context_length = 8192

[models.groq.alibaba."groq/qwen-qwq-32b"]
name = "Qwen QWQ 32B"
context_length = 128000
default_max_tokens = 4096
model_type = "completion"
"#;

    #[test]
    fn test_builtin_is_valid() {
        let catalog = ModelCatalog::builtin();
        catalog.validate().unwrap();
        let entry = catalog.model("groq/qwen-qwq-32b").unwrap();
        assert_eq!(entry.provider, "groq");
        assert_eq!(entry.company, "alibaba");
        assert_eq!(entry.spec.context_length, 128_000);
        assert_eq!(entry.wire_model_id(), "qwen-qwq-32b");
    }

    #[test]
    fn test_wire_model_id_keeps_foreign_prefix() {
        let catalog = ModelCatalog::builtin();
        assert_eq!(
            catalog.model("deepseek-ai/deepseek-r1").unwrap().wire_model_id(),
            "deepseek-ai/deepseek-r1"
        );
        assert_eq!(
            catalog.model("openrouter/deepseek/deepseek-r1").unwrap().wire_model_id(),
            "deepseek/deepseek-r1"
        );
    }

    #[test]
    fn test_unknown_model_and_provider() {
        let catalog = ModelCatalog::builtin();
        assert!(matches!(catalog.model("nope"), Err(CatalogError::UnknownModel(_))));
        assert!(matches!(catalog.provider("nope"), Err(CatalogError::UnknownProvider(_))));
    }

    #[test]
    fn test_parse_catalog() {
        let catalog = ModelCatalog::from_str(SAMPLE_CATALOG).unwrap();

        let local = catalog.provider("local").unwrap();
        assert_eq!(local.wire, WireFormat::Ollama);
        assert_eq!(local.template.user.pre_message, "Q: ");
        assert!(local.api_key_env.is_none());

        let groq = catalog.provider("groq").unwrap();
        assert_eq!(groq.wire, WireFormat::OpenAi);
        assert_eq!(groq.extras.max_retries, Some(2));

        let llama = catalog.model("local/llama3.2").unwrap();
        assert_eq!(llama.spec.default_temperature, 0.7);
        assert_eq!(llama.spec.default_max_tokens, 2048);
        assert!(llama.spec.is_instruction);

        let qwq = catalog.model("groq/qwen-qwq-32b").unwrap();
        assert_eq!(qwq.spec.model_type, Some(PromptKind::Completion));
    }

    #[test]
    fn test_duplicate_model_ids_rejected() {
        let duplicated = r#"
[providers.a]
[providers.b]

[models.a.x."same"]
name = "one"
context_length = 10

[models.b.y."same"]
name = "two"
context_length = 10
"#;
        assert!(matches!(
            ModelCatalog::from_str(duplicated),
            Err(CatalogError::Validation(_))
        ));
    }

    #[test]
    fn test_models_need_a_provider() {
        let orphan = r#"
[models.ghost.x."m"]
name = "m"
context_length = 10
"#;
        assert!(matches!(ModelCatalog::from_str(orphan), Err(CatalogError::Validation(_))));
    }

    #[test]
    fn test_merge_overrides_builtin() {
        let overlay = ModelCatalog::from_str(SAMPLE_CATALOG).unwrap();
        let catalog = ModelCatalog::builtin().merge(overlay).unwrap();

        // Replaced wholesale, so the template falls back to passthrough
        assert_eq!(catalog.provider("groq").unwrap().template, PromptTemplate::default());
        assert_eq!(catalog.model("groq/qwen-qwq-32b").unwrap().spec.default_max_tokens, 4096);
        assert!(catalog.model("groq/mistral-saba-24b").is_ok());
        assert!(catalog.model("local/llama3.2").is_ok());
    }
}
