//! Switchboard library root.

pub mod agent;
pub mod channel;
pub mod cli;
pub mod config;
pub mod core;
pub mod directive;
pub mod error;
pub mod followup;
pub mod logging;
pub mod providers;
pub mod reconnection;
pub mod store;
pub mod summary;
pub mod telegram;

#[cfg(test)]
mod testing;

pub use agent::{AgentGateway, GatewayConfig};
pub use channel::{Delivery, ErrorReporter, InboundBus, InboundMessage};
pub use cli::Commands;
pub use config::{load_settings, Settings};
pub use core::{Collaborators, QueueEntry, RouteDecision, Router, SessionQueue, Switchboard};
pub use directive::{CalendarBackend, DataBackend, DirectiveProcessor, ReplyTarget};
pub use error::{Error, Result};
pub use followup::{IdleFollowUp, SummaryExporter};
pub use providers::AgentBackend;
pub use reconnection::{ReconnectionController, ReconnectionOutcome};
pub use store::{MemoryStateStore, SqliteStore, StateStore};
pub use summary::{SummaryData, SummaryKind};
pub use telegram::run_telegram_daemon;
