//! Error types for Switchboard.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Agent error: {0}")]
    Agent(#[from] crate::providers::ProviderError),

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Directive error: {0}")]
    Directive(String),

    #[error("Calendar error: {0}")]
    Calendar(String),

    #[error("Telegram error: {0}")]
    Telegram(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(format!("sqlite: {}", e))
    }
}
