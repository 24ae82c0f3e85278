//! Application configuration

pub mod catalog;
pub mod prompts;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use catalog::{CatalogEntry, CatalogError, ModelCatalog, ProviderExtras, ProviderSettings, WireFormat};
pub use prompts::{PromptKind, PromptTemplate, RoleWrapper};

/// Token counter used for conversation memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenizerKind {
    Tiktoken,
    Words,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Catalog file merged over the built-in catalog
    pub catalog_path: Option<PathBuf>,
    pub default_model: String,
    /// Memory ceiling for new sessions; defaults to the model context length
    pub memory_tokens: Option<usize>,
    pub tokenizer: TokenizerKind,
    /// Sessions unused for this long are dropped
    pub session_idle_secs: u64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let tokenizer = match env::var("PONDER_TOKENIZER").ok().as_deref() {
            None | Some("tiktoken") => TokenizerKind::Tiktoken,
            Some("words") => TokenizerKind::Words,
            Some(other) => anyhow::bail!("PONDER_TOKENIZER must be 'tiktoken' or 'words', got '{}'", other),
        };

        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            catalog_path: env::var("PONDER_CATALOG").ok().map(PathBuf::from),
            default_model: env::var("PONDER_DEFAULT_MODEL").unwrap_or_else(|_| "groq/qwen-qwq-32b".into()),
            memory_tokens: env::var("PONDER_MEMORY_TOKENS")
                .ok()
                .and_then(|n| n.parse().ok()),
            tokenizer,
            session_idle_secs: env::var("PONDER_SESSION_IDLE_SECS")
                .ok()
                .and_then(|n| n.parse().ok())
                .unwrap_or(3600),
        })
    }

    /// Built-in catalog, overlaid with the configured catalog file if any
    pub fn load_catalog(&self) -> Result<ModelCatalog, CatalogError> {
        let builtin = ModelCatalog::builtin();
        match &self.catalog_path {
            Some(path) => builtin.merge(ModelCatalog::from_file(path)?),
            None => Ok(builtin),
        }
    }
}

/// Provider API keys, keyed by environment variable name
#[derive(Clone, Default)]
pub struct Credentials {
    keys: HashMap<String, String>,
}

impl Credentials {
    /// Read every key variable the catalog mentions from the environment
    pub fn from_env(catalog: &ModelCatalog) -> Self {
        let keys = catalog
            .providers
            .values()
            .filter_map(|p| p.api_key_env.as_ref())
            .filter_map(|name| {
                env::var(name)
                    .ok()
                    .filter(|value| !value.trim().is_empty())
                    .map(|value| (name.clone(), value))
            })
            .collect();
        Self { keys }
    }

    pub fn with(mut self, env_var: impl Into<String>, value: impl Into<String>) -> Self {
        self.keys.insert(env_var.into(), value.into());
        self
    }

    pub fn get(&self, env_var: &str) -> Option<&str> {
        self.keys.get(env_var).map(String::as_str)
    }

    /// Names of the variables that are present
    pub fn available(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("available", &self.available())
            .finish()
    }
}
