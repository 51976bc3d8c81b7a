//! Reasoning agent backends.

use std::sync::Arc;

pub mod ollama;
pub mod provider;

pub use provider::{AgentBackend, ProviderError, Result};

use crate::config::Settings;
use crate::error::Error;

/// Backend factory.
pub fn create_backend(settings: &Settings) -> std::result::Result<Arc<dyn AgentBackend>, Error> {
    match settings.provider.kind.as_str() {
        "ollama" => {
            let mut backend = match &settings.provider.base_url {
                Some(url) => ollama::OllamaBackend::with_base_url(url.clone(), &settings.agents),
                None => ollama::OllamaBackend::new(&settings.agents),
            };
            if let Some(model) = &settings.provider.default_model {
                backend = backend.with_default_model(model.clone());
            }
            Ok(Arc::new(backend))
        }
        other => Err(Error::Config(format!("Unknown provider kind: {}", other))),
    }
}
