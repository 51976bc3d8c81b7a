//! Session tracking for Switchboard.
//!
//! Handles:
//! - Agent assignment per user
//! - Agent-side conversation thread per user
//! - Gateway retry counters
//! - Reconnection wait flags
//! - Exclusive agent-call turns
//!
//! Every operation is one critical section on the map, so a get-or-create
//! followed by a mutation never interleaves with another operation on the
//! same key. The lock is never held across an await.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One user's routing state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// User identity
    pub id: String,

    /// Agent currently serving this user
    pub assigned_agent: String,

    /// Agent-side conversation thread, opened lazily
    pub thread_id: Option<String>,

    /// Consecutive gateway retries since the last settled call
    pub retries: u32,

    /// A reconnection cycle is waiting on this user
    pub reconnecting: bool,

    pub created_at: i64,
    pub updated_at: i64,
}

impl Session {
    pub fn new(id: &str, default_agent: &str) -> Self {
        let now = now_timestamp();
        Self {
            id: id.to_string(),
            assigned_agent: default_agent.to_string(),
            thread_id: None,
            retries: 0,
            reconnecting: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn touch(&mut self) {
        self.updated_at = now_timestamp();
    }
}

fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

type TurnSlots = HashMap<String, Arc<AsyncMutex<()>>>;

/// Exclusive right to call the agent for one session.
///
/// Dropping the turn lets the next caller in; the slot is freed once nobody
/// holds or waits for it.
pub struct Turn<'a> {
    registry: &'a SessionRegistry,
    session_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut turns = self.registry.turns();
        if turns
            .get(&self.session_id)
            .map_or(false, |slot| Arc::strong_count(slot) == 1)
        {
            turns.remove(&self.session_id);
        }
    }
}

/// Session-keyed store of routing state.
pub struct SessionRegistry {
    default_agent: String,
    sessions: Mutex<HashMap<String, Session>>,
    turns: Mutex<TurnSlots>,
}

impl SessionRegistry {
    pub fn new(default_agent: &str) -> Self {
        Self {
            default_agent: default_agent.to_string(),
            sessions: Mutex::new(HashMap::new()),
            turns: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        // A panic while holding the lock cannot leave a session half-written:
        // every mutation below is a single field store.
        self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn turns(&self) -> MutexGuard<'_, TurnSlots> {
        self.turns.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for the session's agent-call turn.
    pub async fn begin_turn(&self, id: &str) -> Turn<'_> {
        let slot = Arc::clone(self.turns().entry(id.to_string()).or_default());
        let guard = slot.lock_owned().await;
        Turn {
            registry: self,
            session_id: id.to_string(),
            guard: Some(guard),
        }
    }

    /// Sessions with a turn held or awaited.
    pub fn busy_turns(&self) -> usize {
        self.turns().len()
    }

    fn with_session<T>(&self, id: &str, f: impl FnOnce(&mut Session) -> T) -> T {
        let mut sessions = self.lock();
        let session = sessions
            .entry(id.to_string())
            .or_insert_with(|| Session::new(id, &self.default_agent));
        f(session)
    }

    /// Snapshot of a session, if it exists.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.lock().get(id).cloned()
    }

    pub fn assigned_agent(&self, id: &str) -> String {
        self.lock()
            .get(id)
            .map(|s| s.assigned_agent.clone())
            .unwrap_or_else(|| self.default_agent.clone())
    }

    /// Assign an agent; returns true if the assignment changed.
    pub fn assign(&self, id: &str, agent_id: &str) -> bool {
        self.with_session(id, |s| {
            if s.assigned_agent == agent_id {
                return false;
            }
            tracing::info!(
                "Session {} reassigned from {} to {}",
                id,
                s.assigned_agent,
                agent_id
            );
            s.assigned_agent = agent_id.to_string();
            s.touch();
            true
        })
    }

    pub fn thread_id(&self, id: &str) -> Option<String> {
        self.lock().get(id).and_then(|s| s.thread_id.clone())
    }

    pub fn set_thread_id(&self, id: &str, thread_id: &str) {
        self.with_session(id, |s| {
            s.thread_id = Some(thread_id.to_string());
            s.touch();
        })
    }

    pub fn retry_count(&self, id: &str) -> u32 {
        self.lock().get(id).map_or(0, |s| s.retries)
    }

    /// Consume one retry if fewer than `max` were used; otherwise reset the
    /// counter and return `None`.
    pub fn take_retry(&self, id: &str, max: u32) -> Option<u32> {
        self.with_session(id, |s| {
            if s.retries < max {
                s.retries += 1;
                Some(s.retries)
            } else {
                s.retries = 0;
                None
            }
        })
    }

    pub fn reset_retries(&self, id: &str) {
        self.with_session(id, |s| s.retries = 0)
    }

    pub fn set_reconnecting(&self, id: &str, reconnecting: bool) {
        self.with_session(id, |s| {
            s.reconnecting = reconnecting;
            s.touch();
        })
    }

    pub fn is_reconnecting(&self, id: &str) -> bool {
        self.lock().get(id).map_or(false, |s| s.reconnecting)
    }

    /// Run `divert` while the session is flagged as reconnecting, in the same
    /// critical section as the flag check. Returns whether it ran.
    ///
    /// A cycle that clears the flag afterwards has therefore seen every
    /// message diverted to it.
    pub fn divert_if_reconnecting(&self, id: &str, divert: impl FnOnce()) -> bool {
        let sessions = self.lock();
        if sessions.get(id).map_or(false, |s| s.reconnecting) {
            divert();
            true
        } else {
            false
        }
    }

    /// Forget a session entirely (assignment, thread, counters).
    pub fn remove(&self, id: &str) -> Option<Session> {
        self.lock().remove(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
