//! SQLite-backed session state, data lookups and calendar.

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::StateStore;
use crate::directive::actions::{
    quote_ident, CalendarBackend, DataBackend, EventUpdate, EventWindow, NewEvent,
};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS session_state (
        session_id TEXT NOT NULL,
        key TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, key)
    );
    CREATE TABLE IF NOT EXISTS calendar_events (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        description TEXT,
        attendees TEXT NOT NULL,
        start_at TEXT NOT NULL,
        end_at TEXT NOT NULL,
        start_ts INTEGER NOT NULL,
        end_ts INTEGER NOT NULL,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_calendar_window ON calendar_events(status, start_ts, end_ts);
"#;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn =
            Connection::open(path).map_err(|e| Error::Store(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("sqlite open: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::Store(format!("sqlite init: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Confirmed events overlapping the window, excluding `skip`.
    fn conflicts(conn: &Connection, window: &EventWindow, skip: Option<&str>) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(
                "SELECT id FROM calendar_events WHERE status = 'confirmed' AND start_ts < ?1 AND end_ts > ?2 AND id != ?3",
            )
            .map_err(|e| Error::Store(format!("sqlite prepare conflicts: {}", e)))?;
        let ids = stmt
            .query_map(
                params![
                    window.end.timestamp(),
                    window.start.timestamp(),
                    skip.unwrap_or("")
                ],
                |row| row.get::<_, String>(0),
            )
            .map_err(|e| Error::Store(format!("sqlite query conflicts: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Store(format!("sqlite read conflicts: {}", e)))?;
        Ok(ids)
    }

    fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))
            .map_err(|e| Error::Store(format!("sqlite table info: {}", e)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| Error::Store(format!("sqlite table info: {}", e)))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::Store(format!("sqlite table info: {}", e)))?;
        Ok(columns)
    }
}

fn sql_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

/// Run a statement and render its rows as a JSON array of objects.
fn rows_as_json(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<String> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| Error::Store(format!("sqlite prepare: {}", e)))?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt
        .query(args)
        .map_err(|e| Error::Store(format!("sqlite query: {}", e)))?;
    let mut out = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|e| Error::Store(format!("sqlite read row: {}", e)))?
    {
        let mut object = Map::new();
        for (i, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(i)
                .map_err(|e| Error::Store(format!("sqlite read column: {}", e)))?;
            object.insert(name.clone(), sql_to_json(value));
        }
        out.push(Value::Object(object));
    }
    Ok(serde_json::to_string(&out)?)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait]
impl StateStore for SqliteStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT value FROM session_state WHERE session_id = ?1 AND key = ?2",
                params![session_id, key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Store(format!("sqlite get state: {}", e)))?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn update(&self, session_id: &str, key: &str, value: Value) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO session_state (session_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(session_id, key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![session_id, key, value.to_string(), now_millis()],
            )
            .map_err(|e| Error::Store(format!("sqlite update state: {}", e)))?;
        Ok(())
    }

    async fn remove(&self, session_id: &str, key: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM session_state WHERE session_id = ?1 AND key = ?2",
                params![session_id, key],
            )
            .map_err(|e| Error::Store(format!("sqlite remove state: {}", e)))?;
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.conn()
            .execute(
                "DELETE FROM session_state WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(|e| Error::Store(format!("sqlite clear state: {}", e)))?;
        Ok(())
    }

    async fn sessions_with(&self, key: &str) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT session_id FROM session_state WHERE key = ?1 ORDER BY session_id")
            .map_err(|e| Error::Store(format!("sqlite prepare sessions: {}", e)))?;
        let ids = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<std::result::Result<Vec<_>, _>>())
            .map_err(|e| Error::Store(format!("sqlite list sessions: {}", e)))?;
        Ok(ids)
    }
}

#[async_trait]
impl DataBackend for SqliteStore {
    async fn execute_query(&self, sql: &str) -> Result<String> {
        rows_as_json(&self.conn(), sql, &[])
    }

    /// Substring match of the term against every column of the table.
    async fn search(&self, table: &str, term: &str) -> Result<String> {
        let conn = self.conn();
        let columns = Self::table_columns(&conn, table)?;
        if columns.is_empty() {
            return Err(Error::NotFound(format!("table {}", table)));
        }

        let predicate = columns
            .iter()
            .map(|c| format!("CAST({} AS TEXT) LIKE ?1", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!("SELECT * FROM {} WHERE {}", quote_ident(table), predicate);
        let pattern = format!("%{}%", term);
        rows_as_json(&conn, &sql, &[&pattern as &dyn rusqlite::ToSql])
    }
}

#[async_trait]
impl CalendarBackend for SqliteStore {
    async fn create_event(&self, window: &EventWindow, event: &NewEvent) -> Result<Value> {
        let conn = self.conn();
        let conflicts = Self::conflicts(&conn, window, None)?;
        if !conflicts.is_empty() {
            return Ok(json!({
                "status": "unavailable",
                "start": window.start.to_rfc3339(),
                "conflicts": conflicts,
            }));
        }

        let id = ulid::Ulid::new().to_string();
        conn.execute(
            "INSERT INTO calendar_events (id, title, description, attendees, start_at, end_at, start_ts, end_ts, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'confirmed', ?9)",
            params![
                id,
                event.title,
                event.description,
                serde_json::to_string(&event.attendees)?,
                window.start.to_rfc3339(),
                window.end.to_rfc3339(),
                window.start.timestamp(),
                window.end.timestamp(),
                now_millis()
            ],
        )
        .map_err(|e| Error::Store(format!("sqlite insert event: {}", e)))?;

        tracing::info!("Created calendar event {} at {}", id, window.start);
        Ok(json!({
            "status": "confirmed",
            "id": id,
            "title": event.title,
            "start": window.start.to_rfc3339(),
            "end": window.end.to_rfc3339(),
        }))
    }

    async fn check_availability(&self, window: &EventWindow) -> Result<Value> {
        let conflicts = Self::conflicts(&self.conn(), window, None)?;
        Ok(json!({
            "available": conflicts.is_empty(),
            "start": window.start.to_rfc3339(),
            "end": window.end.to_rfc3339(),
        }))
    }

    async fn update_event(
        &self,
        id: &str,
        window: Option<&EventWindow>,
        update: &EventUpdate,
    ) -> Result<Value> {
        let conn = self.conn();
        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM calendar_events WHERE id = ?1 AND status = 'confirmed'",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Store(format!("sqlite find event: {}", e)))?;
        if exists.is_none() {
            return Err(Error::NotFound(format!("event {}", id)));
        }

        if let Some(window) = window {
            let conflicts = Self::conflicts(&conn, window, Some(id))?;
            if !conflicts.is_empty() {
                return Ok(json!({
                    "status": "unavailable",
                    "id": id,
                    "start": window.start.to_rfc3339(),
                    "conflicts": conflicts,
                }));
            }
            conn.execute(
                "UPDATE calendar_events SET start_at = ?2, end_at = ?3, start_ts = ?4, end_ts = ?5 WHERE id = ?1",
                params![
                    id,
                    window.start.to_rfc3339(),
                    window.end.to_rfc3339(),
                    window.start.timestamp(),
                    window.end.timestamp()
                ],
            )
            .map_err(|e| Error::Store(format!("sqlite move event: {}", e)))?;
        }
        if let Some(title) = &update.title {
            conn.execute(
                "UPDATE calendar_events SET title = ?2 WHERE id = ?1",
                params![id, title],
            )
            .map_err(|e| Error::Store(format!("sqlite rename event: {}", e)))?;
        }
        if let Some(description) = &update.description {
            conn.execute(
                "UPDATE calendar_events SET description = ?2 WHERE id = ?1",
                params![id, description],
            )
            .map_err(|e| Error::Store(format!("sqlite describe event: {}", e)))?;
        }

        tracing::info!("Updated calendar event {}", id);
        Ok(json!({ "status": "updated", "id": id }))
    }

    async fn delete_event(&self, id: &str) -> Result<Value> {
        let changed = self
            .conn()
            .execute(
                "UPDATE calendar_events SET status = 'cancelled' WHERE id = ?1 AND status = 'confirmed'",
                params![id],
            )
            .map_err(|e| Error::Store(format!("sqlite cancel event: {}", e)))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("event {}", id)));
        }

        tracing::info!("Cancelled calendar event {}", id);
        Ok(json!({ "status": "cancelled", "id": id }))
    }
}
