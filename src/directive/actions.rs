//! Side-effect backends reachable from directives: data queries and calendar actions.

use async_trait::async_trait;
use chrono::{DateTime, Duration, FixedOffset};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::config::Calendar;
use crate::error::{Error, Result};

/// Executes data lookups requested by `[DB_QUERY: ...]` and `[DB: ...]`.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Run a query and return its result serialized as text.
    async fn execute_query(&self, sql: &str) -> Result<String>;

    /// Pattern-match `term` against every row of `table`.
    async fn search(&self, table: &str, term: &str) -> Result<String> {
        self.execute_query(&pattern_query(table, term)).await
    }
}

/// Calendar operations reachable from `[API]` blocks.
#[async_trait]
pub trait CalendarBackend: Send + Sync {
    async fn create_event(&self, window: &EventWindow, event: &NewEvent) -> Result<Value>;

    async fn check_availability(&self, window: &EventWindow) -> Result<Value>;

    async fn update_event(
        &self,
        id: &str,
        window: Option<&EventWindow>,
        update: &EventUpdate,
    ) -> Result<Value>;

    async fn delete_event(&self, id: &str) -> Result<Value>;
}

/// Quote a SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Case-insensitive regex match of a term against a whole row rendered as text.
pub fn pattern_query(table: &str, term: &str) -> String {
    let table = quote_ident(table);
    format!(
        "SELECT * FROM {} WHERE {}::text ~* {}",
        table,
        table,
        quote_literal(term)
    )
}

/// Calendar request carried by an `[API]` block.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApiRequest {
    CreateEvent(NewEvent),
    AvailableEvent(Slot),
    ModifyEvent(EventUpdate),
    CancelEvent(EventRef),
}

impl ApiRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ApiRequest::CreateEvent(_) => "create_event",
            ApiRequest::AvailableEvent(_) => "available_event",
            ApiRequest::ModifyEvent(_) => "modify_event",
            ApiRequest::CancelEvent(_) => "cancel_event",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NewEvent {
    #[serde(alias = "fecha")]
    pub date: String,
    #[serde(alias = "hora")]
    pub time: String,
    #[serde(alias = "titulo", default)]
    pub title: String,
    #[serde(alias = "descripcion", default)]
    pub description: Option<String>,
    #[serde(alias = "invitados", default, deserialize_with = "string_or_list")]
    pub attendees: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Slot {
    #[serde(alias = "fecha")]
    pub date: String,
    #[serde(alias = "hora")]
    pub time: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventUpdate {
    pub id: String,
    #[serde(alias = "fecha", default)]
    pub date: Option<String>,
    #[serde(alias = "hora", default)]
    pub time: Option<String>,
    #[serde(alias = "titulo", default)]
    pub title: Option<String>,
    #[serde(alias = "descripcion", default)]
    pub description: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EventRef {
    pub id: String,
}

/// Agents send attendees either as one comma-separated string or as a list.
fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => s
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        Some(OneOrMany::Many(v)) => v,
    })
}

/// Start and end of a calendar slot.
#[derive(Debug, Clone, PartialEq)]
pub struct EventWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl EventWindow {
    /// Build a window from a `YYYY-MM-DD` date and `HH:MM` time in the configured offset.
    pub fn resolve(date: &str, time: &str, calendar: &Calendar) -> Result<Self> {
        let raw = format!("{}T{}:00{}", date.trim(), time.trim(), calendar.utc_offset);
        let start = DateTime::parse_from_rfc3339(&raw)
            .map_err(|e| Error::Calendar(format!("invalid date/time '{}': {}", raw, e)))?;
        let end = start + Duration::minutes(calendar.event_duration_minutes);
        Ok(Self { start, end })
    }
}

/// Run a calendar request against the backend.
pub async fn execute_api(
    request: &ApiRequest,
    calendar: &dyn CalendarBackend,
    settings: &Calendar,
) -> Result<Value> {
    match request {
        ApiRequest::CreateEvent(event) => {
            let window = EventWindow::resolve(&event.date, &event.time, settings)?;
            calendar.create_event(&window, event).await
        }
        ApiRequest::AvailableEvent(slot) => {
            let window = EventWindow::resolve(&slot.date, &slot.time, settings)?;
            calendar.check_availability(&window).await
        }
        ApiRequest::ModifyEvent(update) => {
            let window = match (&update.date, &update.time) {
                (Some(date), Some(time)) => Some(EventWindow::resolve(date, time, settings)?),
                (None, None) => None,
                _ => {
                    return Err(Error::Calendar(
                        "modify_event needs both date and time to move an event".to_string(),
                    ))
                }
            };
            calendar.update_event(&update.id, window.as_ref(), update).await
        }
        ApiRequest::CancelEvent(event) => calendar.delete_event(&event.id).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_query_escapes() {
        let sql = pattern_query("pro\"ducts", "it's");
        assert_eq!(
            sql,
            "SELECT * FROM \"pro\"\"ducts\" WHERE \"pro\"\"ducts\"::text ~* 'it''s'"
        );
    }

    #[test]
    fn test_spanish_aliases_and_attendees() {
        let req: ApiRequest = serde_json::from_str(
            r#"{"type":"create_event","fecha":"2026-10-20","hora":"09:30","titulo":"Visita","invitados":"a@x.com, b@x.com"}"#,
        )
        .unwrap();
        match req {
            ApiRequest::CreateEvent(e) => {
                assert_eq!(e.title, "Visita");
                assert_eq!(e.attendees, vec!["a@x.com", "b@x.com"]);
                assert_eq!(e.description, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_window_resolution() {
        let window = EventWindow::resolve("2026-10-20", "15:00", &Calendar::default()).unwrap();
        assert_eq!(window.start.to_rfc3339(), "2026-10-20T15:00:00-03:00");
        assert_eq!(window.end.to_rfc3339(), "2026-10-20T16:00:00-03:00");

        assert!(EventWindow::resolve("tomorrow", "15:00", &Calendar::default()).is_err());
    }
}
