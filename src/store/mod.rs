//! Per-session key/value state.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::Result;

pub mod sqlite;

pub use sqlite::SqliteStore;

/// State key holding reconnection progress.
pub const RECONNECTION_KEY: &str = "reconnection";

/// State key holding the last media path a user sent.
pub const LAST_MEDIA_KEY: &str = "last_media";

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>>;

    async fn update(&self, session_id: &str, key: &str, value: Value) -> Result<()>;

    async fn remove(&self, session_id: &str, key: &str) -> Result<()>;

    /// Drop every key of a session.
    async fn clear(&self, session_id: &str) -> Result<()>;

    /// Sessions holding `key`, sorted.
    async fn sessions_with(&self, key: &str) -> Result<Vec<String>>;
}

/// Read a typed value.
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    session_id: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(session_id, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Write a typed value.
pub async fn save<T: Serialize + Sync>(
    store: &dyn StateStore,
    session_id: &str,
    key: &str,
    value: &T,
) -> Result<()> {
    store
        .update(session_id, key, serde_json::to_value(value)?)
        .await
}

/// Process-local store, used by the console session and tests.
#[derive(Default)]
pub struct MemoryStateStore {
    sessions: Mutex<HashMap<String, HashMap<String, Value>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, HashMap<String, Value>>> {
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, session_id: &str, key: &str) -> Result<Option<Value>> {
        Ok(self
            .lock()
            .get(session_id)
            .and_then(|state| state.get(key))
            .cloned())
    }

    async fn update(&self, session_id: &str, key: &str, value: Value) -> Result<()> {
        self.lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, session_id: &str, key: &str) -> Result<()> {
        let mut sessions = self.lock();
        if let Some(state) = sessions.get_mut(session_id) {
            state.remove(key);
            if state.is_empty() {
                sessions.remove(session_id);
            }
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.lock().remove(session_id);
        Ok(())
    }

    async fn sessions_with(&self, key: &str) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, state)| state.contains_key(key))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct Progress {
        attempts_made: u32,
    }

    #[tokio::test]
    async fn test_memory_store_typed_roundtrip() {
        let store = MemoryStateStore::new();
        assert!(load::<Progress>(&store, "u1", RECONNECTION_KEY)
            .await
            .unwrap()
            .is_none());

        save(&store, "u1", RECONNECTION_KEY, &Progress { attempts_made: 2 })
            .await
            .unwrap();
        let got: Option<Progress> = load(&store, "u1", RECONNECTION_KEY).await.unwrap();
        assert_eq!(got, Some(Progress { attempts_made: 2 }));

        store.remove("u1", RECONNECTION_KEY).await.unwrap();
        assert!(store.get("u1", RECONNECTION_KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_only_touches_one_session() {
        let store = MemoryStateStore::new();
        store.update("u1", "a", Value::from(1)).await.unwrap();
        store.update("u2", "a", Value::from(2)).await.unwrap();

        store.update("u2", RECONNECTION_KEY, Value::from(1)).await.unwrap();
        assert_eq!(store.sessions_with("a").await.unwrap(), vec!["u1", "u2"]);

        store.clear("u1").await.unwrap();

        assert!(store.get("u1", "a").await.unwrap().is_none());
        assert_eq!(store.get("u2", "a").await.unwrap(), Some(Value::from(2)));
        assert_eq!(store.sessions_with("a").await.unwrap(), vec!["u2"]);
        assert_eq!(store.sessions_with(RECONNECTION_KEY).await.unwrap(), vec!["u2"]);
    }
}
