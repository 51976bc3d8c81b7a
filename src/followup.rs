//! Idle follow-up: what happens when a user goes quiet.
//!
//! Every inbound message re-arms a per-session timer. When it expires, the
//! assigned agent is asked for a summary whose `type` decides between
//! dropping the conversation, re-engaging the user, or reporting it to an
//! operator chat.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::channel::InboundBus;
use crate::config::{Reconnection, Settings};
use crate::directive::DirectiveProcessor;
use crate::error::Result;
use crate::reconnection::{ReconnectionController, ReconnectionOutcome};
use crate::store::{self, StateStore, LAST_MEDIA_KEY, RECONNECTION_KEY};
use crate::summary::{SummaryData, SummaryKind};

/// Destination for finished conversation summaries.
#[async_trait]
pub trait SummaryExporter: Send + Sync {
    async fn export(&self, session_id: &str, summary: &SummaryData) -> Result<()>;
}

/// Writes summaries to the log as JSON.
pub struct LogExporter;

#[async_trait]
impl SummaryExporter for LogExporter {
    async fn export(&self, session_id: &str, summary: &SummaryData) -> Result<()> {
        let fields = serde_json::to_string(&summary.fields)?;
        tracing::info!(target: "switchboard::export", session = %session_id, %fields, "Exported summary");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct FollowUpConfig {
    pub idle_timeout: Duration,
    pub summary_request: String,
    pub report_chat: Option<String>,
    pub secondary_report_chat: Option<String>,
    pub media_flag_field: String,
    pub contact_link_template: String,
    pub reconnection: Reconnection,
}

impl FollowUpConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            idle_timeout: Duration::from_secs(settings.followup.idle_timeout_secs),
            summary_request: settings.reconnection.summary_request.clone(),
            report_chat: settings.followup.report_chat.clone(),
            secondary_report_chat: settings.followup.secondary_report_chat.clone(),
            media_flag_field: settings.followup.media_flag_field.clone(),
            contact_link_template: settings.channels.contact_link_template.clone(),
            reconnection: settings.reconnection.clone(),
        }
    }
}

pub struct IdleFollowUp {
    processor: Arc<DirectiveProcessor>,
    store: Arc<dyn StateStore>,
    bus: InboundBus,
    exporter: Arc<dyn SummaryExporter>,
    config: FollowUpConfig,
    timers: Mutex<HashMap<String, (u64, JoinHandle<()>)>>,
    generation: AtomicU64,
}

impl IdleFollowUp {
    pub fn new(
        processor: Arc<DirectiveProcessor>,
        store: Arc<dyn StateStore>,
        bus: InboundBus,
        exporter: Arc<dyn SummaryExporter>,
        config: FollowUpConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            processor,
            store,
            bus,
            exporter,
            config,
            timers: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        })
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, (u64, JoinHandle<()>)>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Restart the session's idle timer.
    pub fn touch(self: &Arc<Self>, session_id: &str) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let session = session_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(this.config.idle_timeout).await;
            // Detach before firing so a new message cannot abort the follow-up.
            {
                let mut timers = this.timers();
                if timers.get(&session).map(|(g, _)| *g) == Some(generation) {
                    timers.remove(&session);
                }
            }
            this.fire(&session).await;
        });

        if let Some((_, previous)) = self
            .timers()
            .insert(session_id.to_string(), (generation, handle))
        {
            previous.abort();
        }
    }

    /// Stop the session's idle timer, if armed.
    pub fn cancel(&self, session_id: &str) {
        if let Some((_, handle)) = self.timers().remove(session_id) {
            handle.abort();
        }
    }

    /// Sessions with an armed timer.
    pub fn armed(&self) -> usize {
        self.timers().len()
    }

    /// Summarize the session and dispatch on the summary type.
    pub async fn fire(self: &Arc<Self>, session_id: &str) -> Option<SummaryKind> {
        let sessions = self.processor.gateway().sessions();
        if sessions.is_reconnecting(session_id) {
            tracing::debug!("Skipping idle follow-up for {}: reconnection running", session_id);
            return None;
        }

        let agent = sessions.assigned_agent(session_id);
        let reply = self
            .processor
            .gateway()
            .call(&agent, &self.config.summary_request, session_id)
            .await?;
        let summary = SummaryData::parse(&reply);
        let kind = summary.kind();
        tracing::info!("Idle follow-up for {}: {}", session_id, kind.as_str());

        match kind {
            SummaryKind::NoReportDrop => {
                self.export(session_id, &summary).await;
                self.close(session_id);
            }
            SummaryKind::NoReportFollow => {
                self.reconnect(session_id, Some(summary), false);
            }
            SummaryKind::ReportSecondary => {
                self.report(self.config.secondary_report_chat.as_deref(), session_id, &summary)
                    .await;
                self.export(session_id, &summary).await;
                self.close(session_id);
            }
            SummaryKind::Report => {
                self.report(self.config.report_chat.as_deref(), session_id, &summary)
                    .await;
                self.export(session_id, &summary).await;
                self.close(session_id);
            }
        }
        Some(kind)
    }

    /// Restart reconnection cycles a previous process left unfinished.
    pub async fn resume_pending(self: &Arc<Self>) -> Result<usize> {
        let pending = self.store.sessions_with(RECONNECTION_KEY).await?;
        for session_id in &pending {
            tracing::info!("Resuming interrupted reconnection for {}", session_id);
            self.reconnect(session_id, None, true);
        }
        Ok(pending.len())
    }

    fn reconnect(
        self: &Arc<Self>,
        session_id: &str,
        summary: Option<SummaryData>,
        resume: bool,
    ) -> JoinHandle<ReconnectionOutcome> {
        let mut controller = ReconnectionController::new(
            session_id,
            Arc::clone(&self.processor),
            Arc::clone(&self.store),
            self.bus.clone(),
            self.config.reconnection.clone(),
        );
        if resume {
            controller = controller.resuming();
        }

        let on_success = {
            let this = Arc::clone(self);
            let session = session_id.to_string();
            move |data: Option<SummaryData>| async move {
                let name = data
                    .as_ref()
                    .and_then(|d| d.get(&this.config.reconnection.required_field))
                    .unwrap_or("unknown")
                    .to_string();
                tracing::info!("User {} is back ({})", session, name);
                // Back in the conversation, so idle follow-up applies again.
                this.touch(&session);
            }
        };
        let on_fail = {
            let this = Arc::clone(self);
            let session = session_id.to_string();
            move |data: Option<SummaryData>| async move {
                match data.or(summary) {
                    Some(summary) => this.export(&session, &summary).await,
                    None => tracing::warn!("No summary to export for {}", session),
                }
                this.close(&session);
            }
        };

        controller.start(on_success, on_fail)
    }

    /// Forget the routing state of a finished conversation, unless the user
    /// is already talking again.
    fn close(&self, session_id: &str) {
        let sessions = self.processor.gateway().sessions();
        if self.timers().contains_key(session_id) || sessions.is_reconnecting(session_id) {
            return;
        }
        if sessions.remove(session_id).is_some() {
            tracing::debug!("Closed conversation {}", session_id);
        }
    }

    async fn export(&self, session_id: &str, summary: &SummaryData) {
        if let Err(e) = self.exporter.export(session_id, summary).await {
            tracing::error!("Failed to export summary for {}: {}", session_id, e);
        }
    }

    async fn report(&self, chat: Option<&str>, session_id: &str, summary: &SummaryData) {
        let Some(chat) = chat else {
            tracing::warn!("No report chat configured, summary for {} not sent", session_id);
            return;
        };

        let delivery = self.processor.delivery();
        let text = format!(
            "Conversation summary ({})\n{}\nContact: {}",
            session_id,
            summary.to_report_text(),
            self.config.contact_link_template.replace("{user}", session_id)
        );
        if let Err(e) = delivery.deliver(chat, &text).await {
            tracing::error!("Failed to send report for {}: {}", session_id, e);
            return;
        }

        if !summary.is_yes(&self.config.media_flag_field) {
            return;
        }
        match store::load::<String>(self.store.as_ref(), session_id, LAST_MEDIA_KEY).await {
            Ok(Some(path)) => {
                if let Err(e) = delivery.deliver_media(chat, &PathBuf::from(path)).await {
                    tracing::error!("Failed to forward media for {}: {}", session_id, e);
                }
            }
            Ok(None) => tracing::debug!("No media captured for {}", session_id),
            Err(e) => tracing::warn!("Could not read last media for {}: {}", session_id, e),
        }
    }
}
