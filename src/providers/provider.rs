//! Reasoning agent backend trait for Switchboard.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    #[error("Unknown thread: {0}")]
    UnknownThread(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// A backend that hosts the reasoning agents.
///
/// Conversations live in backend-side threads. A thread is shared by every
/// agent the session is routed to, so a hand-off keeps the history.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Backend name.
    fn name(&self) -> &str;

    /// Open a fresh conversation thread and return its id.
    async fn open_thread(&self) -> Result<String>;

    /// Send one message to an agent on a thread and wait for its reply.
    ///
    /// May hang indefinitely; callers bound it themselves.
    async fn invoke(&self, agent_id: &str, message: &str, thread_id: &str) -> Result<String>;

    /// Whether an agent run is still in progress on the thread.
    async fn is_running(&self, thread_id: &str) -> Result<bool>;
}

impl ProviderError {
    pub fn other(s: impl Into<String>) -> Self {
        ProviderError::Other(s.into())
    }
}
