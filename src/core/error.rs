//! Errors surfaced by the chat core

use crate::config::CatalogError;
use crate::providers::ProviderError;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    /// Unknown model or provider, missing endpoint, invalid settings
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{env_var} environment variable not set (required by provider {provider})")]
    MissingCredential { provider: String, env_var: String },

    #[error("Error generating response from {provider}/{model}: {source}")]
    Generation {
        provider: String,
        model: String,
        #[source]
        source: ProviderError,
    },

    #[error("A response is already being generated for this session")]
    Busy,
}

impl From<CatalogError> for ChatError {
    fn from(err: CatalogError) -> Self {
        ChatError::Configuration(err.to_string())
    }
}
