//! Agent gateway: timeout-guarded agent calls with bounded retries.
//!
//! Each call races its in-flight attempts against a per-attempt timer. A timer
//! expiry starts another attempt with the same message while earlier attempts
//! stay in flight; whichever settles first wins and the rest are dropped.
//! At most one call per user is active at a time.

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::channel::ErrorReporter;
use crate::config::Settings;
use crate::core::conversation::SessionRegistry;
use crate::providers::{AgentBackend, ProviderError};

/// Retries after the first attempt before the call is abandoned.
pub const MAX_RETRIES: u32 = 2;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub timeout: Duration,
    pub contact_link_template: String,
}

impl GatewayConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            timeout: settings.gateway.timeout(),
            contact_link_template: settings.channels.contact_link_template.clone(),
        }
    }

    fn contact_link(&self, user_id: &str) -> String {
        self.contact_link_template.replace("{user}", user_id)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

type Attempt = BoxFuture<'static, Result<String, ProviderError>>;

pub struct AgentGateway {
    backend: Arc<dyn AgentBackend>,
    sessions: Arc<SessionRegistry>,
    reporter: Arc<dyn ErrorReporter>,
    config: GatewayConfig,
}

impl AgentGateway {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        sessions: Arc<SessionRegistry>,
        reporter: Arc<dyn ErrorReporter>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            backend,
            sessions,
            reporter,
            config,
        }
    }

    pub fn backend(&self) -> &Arc<dyn AgentBackend> {
        &self.backend
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn retry_count(&self, user_id: &str) -> u32 {
        self.sessions.retry_count(user_id)
    }

    /// Send `message` to `agent_id` on the user's conversation thread.
    ///
    /// Calls for one user never overlap: each waits for the user's turn first.
    ///
    /// Returns `None` when every attempt failed or timed out; the failure has
    /// then been reported exactly once.
    pub async fn call(&self, agent_id: &str, message: &str, user_id: &str) -> Option<String> {
        let _turn = self.sessions.begin_turn(user_id).await;

        let thread_id = match self.ensure_thread(agent_id, user_id).await {
            Ok(thread_id) => thread_id,
            Err(e) => {
                tracing::error!("Could not open a conversation thread for {}: {}", user_id, e);
                self.report(&format!("Could not open conversation thread: {}", e), user_id)
                    .await;
                return None;
            }
        };

        let mut in_flight: FuturesUnordered<Attempt> = FuturesUnordered::new();
        in_flight.push(self.attempt(agent_id, message, &thread_id));

        let timer = tokio::time::sleep(self.config.timeout);
        tokio::pin!(timer);

        loop {
            let retry = tokio::select! {
                Some(result) = in_flight.next() => match result {
                    Ok(text) => {
                        self.sessions.reset_retries(user_id);
                        return Some(text);
                    }
                    Err(e) => {
                        tracing::warn!("Agent {} failed for {}: {}", agent_id, user_id, e);
                        // Another attempt may still settle.
                        if !in_flight.is_empty() {
                            continue;
                        }
                        self.sessions.take_retry(user_id, MAX_RETRIES)
                    }
                },
                _ = &mut timer => {
                    tracing::warn!(
                        "Agent {} timed out after {:?} for {}",
                        agent_id,
                        self.config.timeout,
                        user_id
                    );
                    self.sessions.take_retry(user_id, MAX_RETRIES)
                }
            };

            match retry {
                Some(n) => {
                    tracing::warn!(
                        "Retrying agent {} for {} ({}/{})",
                        agent_id,
                        user_id,
                        n,
                        MAX_RETRIES
                    );
                    in_flight.push(self.attempt(agent_id, message, &thread_id));
                    timer.as_mut().reset(Instant::now() + self.config.timeout);
                }
                None => {
                    tracing::error!(
                        "Agent {} gave no response for {} after {} attempts",
                        agent_id,
                        user_id,
                        MAX_RETRIES + 1
                    );
                    self.report(
                        &format!(
                            "No response from agent {} after {} attempts",
                            agent_id,
                            MAX_RETRIES + 1
                        ),
                        user_id,
                    )
                    .await;
                    return None;
                }
            }
        }
    }

    fn attempt(&self, agent_id: &str, message: &str, thread_id: &str) -> Attempt {
        let backend = Arc::clone(&self.backend);
        let agent_id = agent_id.to_string();
        let message = message.to_string();
        let thread_id = thread_id.to_string();
        async move { backend.invoke(&agent_id, &message, &thread_id).await }.boxed()
    }

    /// Return the user's thread, opening and priming a new one if needed.
    async fn ensure_thread(&self, agent_id: &str, user_id: &str) -> Result<String, ProviderError> {
        if let Some(thread_id) = self.sessions.thread_id(user_id) {
            return Ok(thread_id);
        }

        let thread_id = self.backend.open_thread().await?;
        self.sessions.set_thread_id(user_id, &thread_id);
        tracing::debug!("Opened thread {} for {}", thread_id, user_id);

        let priming = priming_message();
        match tokio::time::timeout(
            self.config.timeout,
            self.backend.invoke(agent_id, &priming, &thread_id),
        )
        .await
        {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::warn!("Priming message failed for {}: {}", user_id, e),
            Err(_) => tracing::warn!("Priming message timed out for {}", user_id),
        }

        Ok(thread_id)
    }

    async fn report(&self, error: &str, user_id: &str) {
        let link = self.config.contact_link(user_id);
        self.reporter.report(error, user_id, &link).await;
    }
}

/// Message that anchors a fresh thread to the current local date and time.
pub fn priming_message() -> String {
    format!(
        "The current date and time is: {}",
        chrono::Local::now().format("%Y-%m-%d %H:%M")
    )
}
