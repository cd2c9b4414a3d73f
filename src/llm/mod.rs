//! LLM integration.
//!
//! The classifier talks to the model only through the `LlmProvider` trait.
//! `OpenAiProvider` is the production implementation; tests substitute
//! scripted providers.

pub mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Override for OpenAI-compatible endpoints.
    pub base_url: Option<String>,
    pub request_timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiProvider::new(
        config.api_key.clone(),
        &config.model,
        config.base_url.clone(),
        config.request_timeout,
    )?;
    tracing::info!(model = %config.model, "Using OpenAI-compatible provider");
    Ok(Arc::new(provider))
}
