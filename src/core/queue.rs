//! Per-session message queue for Switchboard.
//!
//! Each session gets a FIFO and at most one worker task draining it. The
//! worker awaits full processing of an entry (agent call, directives,
//! delivery) before popping the next, so entries of one session never
//! overlap. Different sessions are drained concurrently.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::channel::InboundMessage;
use crate::error::Result;

/// A queued inbound message.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueEntry {
    /// Unique ID (ULID)
    pub id: String,

    /// Session the entry belongs to
    pub session_id: String,

    /// Inbound message
    pub message: InboundMessage,

    /// When enqueued (unix timestamp, ms)
    pub enqueued_at: i64,
}

impl QueueEntry {
    /// Create an entry for the message's sender.
    pub fn new(message: InboundMessage) -> Self {
        let enqueued_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();

        Self {
            id: ulid::Ulid::new().to_string(),
            session_id: message.from.clone(),
            message,
            enqueued_at,
        }
    }
}

/// Processes one dequeued entry to completion.
#[async_trait]
pub trait EntryProcessor: Send + Sync {
    async fn process(&self, entry: QueueEntry) -> Result<()>;
}

#[derive(Default)]
struct SessionLane {
    entries: VecDeque<QueueEntry>,
}

/// Per-session FIFO serializer.
pub struct SessionQueue {
    processor: Arc<dyn EntryProcessor>,
    lanes: Mutex<HashMap<String, SessionLane>>,
}

impl SessionQueue {
    pub fn new(processor: Arc<dyn EntryProcessor>) -> Arc<Self> {
        Arc::new(Self {
            processor,
            lanes: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionLane>> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append an entry and start a worker if the session has none.
    ///
    /// A lane exists exactly while its worker runs, so lane creation is the
    /// worker-start signal.
    pub fn enqueue(self: &Arc<Self>, entry: QueueEntry) -> String {
        let id = entry.id.clone();
        let session_id = entry.session_id.clone();

        let start_worker = {
            let mut lanes = self.lock();
            let fresh = !lanes.contains_key(&session_id);
            lanes
                .entry(session_id.clone())
                .or_default()
                .entries
                .push_back(entry);
            fresh
        };

        tracing::debug!("Enqueued {} for session {}", id, session_id);

        if start_worker {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain(session_id).await });
        }

        id
    }

    /// Pop the next entry, or drop the lane when it is empty.
    fn next_entry(&self, session_id: &str) -> Option<QueueEntry> {
        let mut lanes = self.lock();
        let next = lanes
            .get_mut(session_id)
            .and_then(|lane| lane.entries.pop_front());
        if next.is_none() {
            lanes.remove(session_id);
        }
        next
    }

    async fn drain(self: Arc<Self>, session_id: String) {
        tracing::debug!("Worker started for session {}", session_id);

        while let Some(entry) = self.next_entry(&session_id) {
            let entry_id = entry.id.clone();
            let outcome = AssertUnwindSafe(self.processor.process(entry))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => tracing::debug!("Processed {} for session {}", entry_id, session_id),
                Ok(Err(e)) => {
                    tracing::error!("Error processing {} for session {}: {}", entry_id, session_id, e)
                }
                Err(_) => tracing::error!(
                    "Panic while processing {} for session {}",
                    entry_id,
                    session_id
                ),
            }
        }

        tracing::debug!("Worker finished for session {}", session_id);
    }

    /// Entries waiting behind the one in progress.
    pub fn pending(&self, session_id: &str) -> usize {
        self.lock().get(session_id).map_or(0, |lane| lane.entries.len())
    }

    /// Sessions with a running worker.
    pub fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
