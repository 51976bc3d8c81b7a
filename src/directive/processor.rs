//! Directive execution loop.
//!
//! A reply is checked for a directive; if one is found it is executed, its
//! result is sent back to the same agent and the new reply is checked again.
//! The first reply without a directive is cleaned and delivered to the user.

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;

use super::actions::{self, CalendarBackend, DataBackend};
use super::parser::{self, sanitize, split_chunks};
use super::Directive;
use crate::agent::AgentGateway;
use crate::channel::Delivery;
use crate::config::{Calendar, Settings};
use crate::error::Result;

/// Directive resubmissions allowed per inbound message.
pub const MAX_DIRECTIVE_DEPTH: u32 = 5;

/// Delay before resubmitting when the session has no thread yet.
const NO_THREAD_DELAY: Duration = Duration::from_secs(2);

/// Who a reply belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyTarget {
    pub session_id: String,
    pub agent_id: String,
}

impl ReplyTarget {
    pub fn new(session_id: &str, agent_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
        }
    }
}

/// How processing of one reply ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Plain text delivered in this many messages.
    Delivered(usize),
    /// The agent stopped answering during a resubmission.
    NoReply,
    /// Directive chain exceeded the depth limit; nothing delivered.
    DepthExceeded,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub run_poll_attempts: u32,
    pub run_poll_interval: Duration,
    pub settle_delay: Duration,
    pub chunk_delay: Duration,
    pub pending_action_marker: String,
    pub continuation_token: String,
    pub confirmation_initial_wait: Duration,
    pub confirmation_poll: Duration,
    pub confirmation_max_polls: u32,
    pub calendar: Calendar,
}

impl ProcessorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        let d = &settings.directives;
        Self {
            run_poll_attempts: d.run_poll_attempts,
            run_poll_interval: Duration::from_millis(d.run_poll_interval_ms),
            settle_delay: Duration::from_millis(d.settle_delay_ms),
            chunk_delay: Duration::from_millis(d.chunk_delay_ms),
            pending_action_marker: d.pending_action_marker.clone(),
            continuation_token: d.continuation_token.clone(),
            confirmation_initial_wait: Duration::from_secs(d.confirmation_initial_wait_secs),
            confirmation_poll: Duration::from_secs(d.confirmation_poll_secs),
            confirmation_max_polls: d.confirmation_max_polls,
            calendar: settings.calendar.clone(),
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

pub struct DirectiveProcessor {
    gateway: Arc<AgentGateway>,
    data: Arc<dyn DataBackend>,
    calendar: Arc<dyn CalendarBackend>,
    delivery: Arc<dyn Delivery>,
    config: ProcessorConfig,
    pending_id: Regex,
}

impl DirectiveProcessor {
    pub fn new(
        gateway: Arc<AgentGateway>,
        data: Arc<dyn DataBackend>,
        calendar: Arc<dyn CalendarBackend>,
        delivery: Arc<dyn Delivery>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            gateway,
            data,
            calendar,
            delivery,
            config,
            pending_id: Regex::new(r"ID:\s*\w+").expect("static regex"),
        }
    }

    pub fn gateway(&self) -> &Arc<AgentGateway> {
        &self.gateway
    }

    pub fn delivery(&self) -> &Arc<dyn Delivery> {
        &self.delivery
    }

    /// Resolve directives in `reply` and deliver the final text.
    pub async fn process(&self, reply: &str, target: &ReplyTarget) -> Result<ProcessOutcome> {
        let mut reply = reply.to_string();
        let mut depth: u32 = 0;

        loop {
            if depth > MAX_DIRECTIVE_DEPTH {
                tracing::error!(
                    "Directive depth limit ({}) exceeded for {}, dropping reply",
                    MAX_DIRECTIVE_DEPTH,
                    target.session_id
                );
                return Ok(ProcessOutcome::DepthExceeded);
            }

            let Some(directive) = parser::parse(&reply) else {
                return self.deliver_plain(&reply, target).await;
            };

            let feedback = match self.execute(&directive).await {
                Ok(feedback) => feedback,
                Err(e) => {
                    tracing::error!(
                        "Directive failed for {}: {}; delivering reply as is",
                        target.session_id,
                        e
                    );
                    return self.deliver_plain(&reply, target).await;
                }
            };

            self.wait_for_idle_run(&target.session_id).await;

            tracing::debug!(
                "Resubmitting directive result to {} for {} (depth {})",
                target.agent_id,
                target.session_id,
                depth + 1
            );
            match self
                .gateway
                .call(&target.agent_id, &feedback, &target.session_id)
                .await
            {
                Some(next) => {
                    reply = next;
                    depth += 1;
                }
                None => return Ok(ProcessOutcome::NoReply),
            }
        }
    }

    /// Run a directive and render the text fed back to the agent.
    async fn execute(&self, directive: &Directive) -> Result<String> {
        match directive {
            Directive::DbQuery { sql } => {
                tracing::info!("Running data query: {}", sql);
                let result = self.data.execute_query(sql).await?;
                Ok(db_result(&result))
            }
            Directive::DbSearch { table, term } => {
                tracing::info!("Searching {} for '{}'", table, term);
                let result = self.data.search(table, term).await?;
                Ok(db_result(&result))
            }
            Directive::ApiAction(request) => {
                tracing::info!("Running calendar action {}", request.kind());
                let value =
                    actions::execute_api(request, self.calendar.as_ref(), &self.config.calendar)
                        .await?;
                Ok(serde_json::to_string_pretty(&value)?)
            }
        }
    }

    /// Wait until the agent has no run in flight on the session's thread.
    async fn wait_for_idle_run(&self, session_id: &str) {
        let Some(thread_id) = self.gateway.sessions().thread_id(session_id) else {
            tokio::time::sleep(NO_THREAD_DELAY).await;
            return;
        };

        for _ in 0..self.config.run_poll_attempts {
            match self.gateway.backend().is_running(&thread_id).await {
                Ok(true) => tokio::time::sleep(self.config.run_poll_interval).await,
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("Could not check run state on {}: {}", thread_id, e);
                    break;
                }
            }
        }
        tokio::time::sleep(self.config.settle_delay).await;
    }

    async fn deliver_plain(&self, reply: &str, target: &ReplyTarget) -> Result<ProcessOutcome> {
        let clean = sanitize(reply);
        if clean.is_empty() {
            tracing::debug!("Nothing left to deliver to {}", target.session_id);
            return Ok(ProcessOutcome::Delivered(0));
        }

        if !self.config.pending_action_marker.is_empty()
            && clean.contains(&self.config.pending_action_marker)
        {
            let Some(confirmed) = self.await_confirmation(clean, target).await else {
                tracing::warn!("No confirmation reply for {}, nothing delivered", target.session_id);
                return Ok(ProcessOutcome::NoReply);
            };
            self.send(&target.session_id, &confirmed).await;
            return Ok(ProcessOutcome::Delivered(1));
        }

        let chunks = split_chunks(&clean);
        for (i, chunk) in chunks.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            self.send(&target.session_id, chunk).await;
        }
        Ok(ProcessOutcome::Delivered(chunks.len()))
    }

    /// Nudge the agent with the continuation token until it stops reporting
    /// a pending confirmation id. `None` when the agent stopped answering.
    async fn await_confirmation(&self, pending: String, target: &ReplyTarget) -> Option<String> {
        tracing::info!("Pending action for {}, waiting for confirmation", target.session_id);
        tokio::time::sleep(self.config.confirmation_initial_wait).await;

        let mut current = pending;
        for poll in 1..=self.config.confirmation_max_polls {
            match self
                .gateway
                .call(&target.agent_id, &self.config.continuation_token, &target.session_id)
                .await
            {
                Some(next) => current = sanitize(&next),
                None => return None,
            }
            if !self.pending_id.is_match(&current) {
                break;
            }
            if poll < self.config.confirmation_max_polls {
                tokio::time::sleep(self.config.confirmation_poll).await;
            }
        }
        Some(current)
    }

    async fn send(&self, session_id: &str, text: &str) {
        if let Err(e) = self.delivery.deliver(session_id, text).await {
            tracing::error!("Failed to deliver to {}: {}", session_id, e);
        }
    }
}

fn db_result(result: &str) -> String {
    format!("[DB_RESULT] {} [/DB_RESULT]", result)
}
