//! Messaging channel contracts: inbound messages, delivery and operator reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, mpsc};

use crate::error::Result;

/// Capacity of the inbound broadcast bus.
const INBOUND_BUS_CAPACITY: usize = 256;

/// A message received from the channel.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct InboundMessage {
    /// Sender identity; doubles as the session id.
    pub from: String,

    /// Text body (caption for media messages)
    pub body: String,

    pub is_group: bool,
    pub is_broadcast: bool,
    pub is_system: bool,
    pub is_bot: bool,

    /// Local path of attached media, if any
    pub media: Option<PathBuf>,

    /// Unix timestamp (ms)
    pub timestamp: i64,
}

impl InboundMessage {
    /// Create a plain text message with current timestamp.
    pub fn text(from: &str, body: &str) -> Self {
        Self {
            from: from.to_string(),
            body: body.to_string(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    pub fn with_media(mut self, path: impl Into<PathBuf>) -> Self {
        self.media = Some(path.into());
        self
    }

    /// A real user message: not from a group, broadcast, system or bot, and
    /// carrying non-blank text.
    pub fn is_qualifying(&self) -> bool {
        !self.is_group
            && !self.is_broadcast
            && !self.is_system
            && !self.is_bot
            && !self.body.trim().is_empty()
    }
}

/// Outbound side of the messaging channel.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver(&self, session_id: &str, text: &str) -> Result<()>;

    async fn deliver_media(&self, session_id: &str, path: &Path) -> Result<()>;
}

/// Operator-facing failure channel.
#[async_trait]
pub trait ErrorReporter: Send + Sync {
    async fn report(&self, error: &str, user_id: &str, contact_link: &str);
}

/// Reports failures by delivering them to an operator chat.
pub struct OperatorReporter {
    delivery: Arc<dyn Delivery>,
    operator_chat: Option<String>,
}

impl OperatorReporter {
    pub fn new(delivery: Arc<dyn Delivery>, operator_chat: Option<String>) -> Self {
        Self {
            delivery,
            operator_chat,
        }
    }
}

#[async_trait]
impl ErrorReporter for OperatorReporter {
    async fn report(&self, error: &str, user_id: &str, contact_link: &str) {
        tracing::error!("Reporting failure for {}: {}", user_id, error);

        let Some(chat) = &self.operator_chat else {
            tracing::warn!("No operator chat configured, report for {} dropped", user_id);
            return;
        };

        let text = format!(
            "Error: {}\nUser: {}\nContact: {}",
            error, user_id, contact_link
        );
        if let Err(e) = self.delivery.deliver(chat, &text).await {
            tracing::error!("Failed to deliver operator report: {}", e);
        }
    }
}

/// Fan-out of inbound messages diverted to whatever waits on a user
/// (reconnection), plus the way back into the queue for diverted messages
/// nobody consumed.
#[derive(Clone)]
pub struct InboundBus {
    tx: broadcast::Sender<InboundMessage>,
    requeue_tx: mpsc::UnboundedSender<InboundMessage>,
    requeue_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<InboundMessage>>>>,
}

impl InboundBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(INBOUND_BUS_CAPACITY);
        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        Self {
            tx,
            requeue_tx,
            requeue_rx: Arc::new(Mutex::new(Some(requeue_rx))),
        }
    }

    /// Publish a message; having no subscriber is not an error.
    pub fn publish(&self, message: &InboundMessage) {
        let _ = self.tx.send(message.clone());
    }

    /// Subscribe; dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.tx.subscribe()
    }

    /// Hand a diverted message back for normal processing.
    pub fn requeue(&self, message: InboundMessage) {
        if self.requeue_tx.send(message).is_err() {
            tracing::warn!("Requeue receiver is gone, message dropped");
        }
    }

    /// The receiving end of [`InboundBus::requeue`]; only the first caller
    /// gets it.
    pub fn take_requeued(&self) -> Option<mpsc::UnboundedReceiver<InboundMessage>> {
        self.requeue_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Default for InboundBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Prints deliveries to stdout; used by the local console session.
pub struct ConsoleDelivery;

#[async_trait]
impl Delivery for ConsoleDelivery {
    async fn deliver(&self, session_id: &str, text: &str) -> Result<()> {
        println!("[{}] {}", session_id, text);
        Ok(())
    }

    async fn deliver_media(&self, session_id: &str, path: &Path) -> Result<()> {
        println!("[{}] <media {}>", session_id, path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualifying_filter() {
        let msg = InboundMessage::text("u1", "hello");
        assert!(msg.is_qualifying());
        assert!(msg.timestamp > 0);

        let blank = InboundMessage::text("u1", "   ");
        assert!(!blank.is_qualifying());

        for flag in 0..4 {
            let mut m = InboundMessage::text("u1", "hello");
            match flag {
                0 => m.is_group = true,
                1 => m.is_broadcast = true,
                2 => m.is_system = true,
                _ => m.is_bot = true,
            }
            assert!(!m.is_qualifying());
        }
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = InboundBus::new();
        bus.publish(&InboundMessage::text("u1", "before"));

        let mut rx = bus.subscribe();
        bus.publish(&InboundMessage::text("u1", "after"));

        let got = rx.recv().await.unwrap();
        assert_eq!(got.body, "after");
    }

    #[tokio::test]
    async fn test_requeued_messages_come_back_once() {
        let bus = InboundBus::new();
        bus.requeue(InboundMessage::text("u1", "later"));

        let mut rx = bus.clone().take_requeued().unwrap();
        assert!(bus.take_requeued().is_none());
        assert_eq!(rx.recv().await.unwrap().body, "later");
    }
}
