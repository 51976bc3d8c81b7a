//! Directive protocol: structured instructions an agent embeds in its reply.
//!
//! - `[DB_QUERY: <sql>]` runs a query
//! - `[DB: T:"table", D:"term"]` searches a table
//! - `[API] {json} [/API]` runs a calendar action
//!
//! The result of each is fed back to the agent, whose next reply is processed
//! the same way until plain text remains.

pub mod actions;
pub mod parser;
pub mod processor;

pub use actions::{ApiRequest, CalendarBackend, DataBackend};
pub use parser::{parse, sanitize, split_chunks};
pub use processor::{DirectiveProcessor, ReplyTarget, MAX_DIRECTIVE_DEPTH};

/// A directive parsed from reply text.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    DbQuery { sql: String },
    DbSearch { table: String, term: String },
    ApiAction(ApiRequest),
}
