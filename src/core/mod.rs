//! Core module - queue, routing, sessions and the processing pipeline.
//!
//! This module contains the heart of Switchboard's message processing:
//! - Per-session message queue
//! - Hand-off routing between agents
//! - Session tracking
//! - Assembly of the collaborators into a running router

use std::sync::Arc;

pub mod conversation;
pub mod pipeline;
pub mod queue;
pub mod routing;

pub use conversation::{Session, SessionRegistry};
pub use pipeline::MessagePipeline;
pub use queue::{EntryProcessor, QueueEntry, SessionQueue};
pub use routing::{RouteDecision, Router};

use crate::agent::{AgentGateway, GatewayConfig};
use crate::channel::{Delivery, ErrorReporter, InboundBus, InboundMessage};
use crate::config::Settings;
use crate::directive::processor::ProcessorConfig;
use crate::directive::{CalendarBackend, DataBackend, DirectiveProcessor};
use crate::error::Result;
use crate::followup::{FollowUpConfig, IdleFollowUp, SummaryExporter};
use crate::providers::AgentBackend;
use crate::store::StateStore;

/// External collaborators a running router needs.
pub struct Collaborators {
    pub backend: Arc<dyn AgentBackend>,
    pub delivery: Arc<dyn Delivery>,
    pub reporter: Arc<dyn ErrorReporter>,
    pub data: Arc<dyn DataBackend>,
    pub calendar: Arc<dyn CalendarBackend>,
    pub store: Arc<dyn StateStore>,
    pub exporter: Arc<dyn SummaryExporter>,
}

/// Wired router: transports hand inbound messages to [`Switchboard::accept`].
pub struct Switchboard {
    pub sessions: Arc<SessionRegistry>,
    pub processor: Arc<DirectiveProcessor>,
    pub followup: Arc<IdleFollowUp>,
    pub queue: Arc<SessionQueue>,
    pub bus: InboundBus,
}

impl Switchboard {
    pub fn new(settings: &Settings, c: Collaborators) -> Self {
        let sessions = Arc::new(SessionRegistry::new(&settings.routing.default_agent));
        let gateway = Arc::new(AgentGateway::new(
            c.backend,
            Arc::clone(&sessions),
            c.reporter,
            GatewayConfig::from_settings(settings),
        ));
        let processor = Arc::new(DirectiveProcessor::new(
            gateway,
            c.data,
            c.calendar,
            c.delivery,
            ProcessorConfig::from_settings(settings),
        ));

        let bus = InboundBus::new();
        let followup = IdleFollowUp::new(
            Arc::clone(&processor),
            Arc::clone(&c.store),
            bus.clone(),
            c.exporter,
            FollowUpConfig::from_settings(settings),
        );
        let pipeline = MessagePipeline::new(
            Arc::clone(&processor),
            Router::from_settings(settings),
            c.store,
        )
        .with_followup(Arc::clone(&followup));
        let queue = SessionQueue::new(Arc::new(pipeline));

        // Messages a reconnection cycle received but did not consume.
        if let Some(mut requeued) = bus.take_requeued() {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                while let Some(message) = requeued.recv().await {
                    tracing::debug!("Requeueing message from {}", message.from);
                    queue.enqueue(QueueEntry::new(message));
                }
            });
        }

        Self {
            sessions,
            processor,
            followup,
            queue,
            bus,
        }
    }

    /// Take one inbound message from a transport.
    ///
    /// Messages from real users are enqueued, unless a reconnection cycle is
    /// waiting on that user. Those are published to the bus for the cycle,
    /// which hands back whatever it does not consume. Returns the queue entry id.
    pub fn accept(&self, message: InboundMessage) -> Option<String> {
        let from_user =
            !message.is_group && !message.is_broadcast && !message.is_system && !message.is_bot;
        if !from_user || (message.body.trim().is_empty() && message.media.is_none()) {
            tracing::debug!("Ignoring non-user message from {}", message.from);
            return None;
        }
        if self
            .sessions
            .divert_if_reconnecting(&message.from, || self.bus.publish(&message))
        {
            tracing::debug!("Message from {} goes to its reconnection cycle", message.from);
            return None;
        }

        Some(self.queue.enqueue(QueueEntry::new(message)))
    }

    /// Restart reconnection cycles left unfinished by a previous run.
    pub async fn resume_reconnections(&self) -> Result<usize> {
        self.followup.resume_pending().await
    }
}
