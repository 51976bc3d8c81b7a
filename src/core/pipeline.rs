//! One processing step for a dequeued message.
//!
//! reset command → media capture → agent call → routing decision →
//! directive processing and delivery → optional hand-off round.

use async_trait::async_trait;
use std::sync::Arc;

use super::queue::{EntryProcessor, QueueEntry};
use super::routing::{RouteDecision, Router};
use crate::directive::{DirectiveProcessor, ReplyTarget};
use crate::error::Result;
use crate::followup::IdleFollowUp;
use crate::store::{StateStore, LAST_MEDIA_KEY};

/// Commands that wipe a session.
const RESET_COMMANDS: [&str; 2] = ["#reset", "#cerrar"];

const RESET_CONFIRMATION: &str = "Conversation reset. Write again to start over.";

pub fn is_reset_command(body: &str) -> bool {
    let body = body.trim();
    RESET_COMMANDS.iter().any(|c| body.eq_ignore_ascii_case(c))
}

pub struct MessagePipeline {
    processor: Arc<DirectiveProcessor>,
    router: Router,
    store: Arc<dyn StateStore>,
    followup: Option<Arc<IdleFollowUp>>,
}

impl MessagePipeline {
    pub fn new(processor: Arc<DirectiveProcessor>, router: Router, store: Arc<dyn StateStore>) -> Self {
        Self {
            processor,
            router,
            store,
            followup: None,
        }
    }

    pub fn with_followup(mut self, followup: Arc<IdleFollowUp>) -> Self {
        self.followup = Some(followup);
        self
    }

    async fn reset(&self, session_id: &str) -> Result<()> {
        tracing::info!("Resetting session {}", session_id);
        if let Some(followup) = &self.followup {
            followup.cancel(session_id);
        }
        self.processor.gateway().sessions().remove(session_id);
        self.store.clear(session_id).await?;
        self.processor
            .delivery()
            .deliver(session_id, RESET_CONFIRMATION)
            .await
    }

    /// Second round after a hand-off: the new agent gets the summary.
    async fn hand_off(&self, session_id: &str, from: &str, to: &str, reply: &str) -> Result<()> {
        let visible = self.router.strip_routing_artifacts(reply);
        self.processor
            .process(&visible, &ReplyTarget::new(session_id, from))
            .await?;

        self.processor.gateway().sessions().assign(session_id, to);
        let summary = self.router.extract_summary(reply);
        tracing::info!("Handing {} off from {} to {}", session_id, from, to);

        if let Some(first) = self.processor.gateway().call(to, &summary, session_id).await {
            self.processor
                .process(&first, &ReplyTarget::new(session_id, to))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EntryProcessor for MessagePipeline {
    async fn process(&self, entry: QueueEntry) -> Result<()> {
        let session_id = entry.session_id.as_str();
        let message = &entry.message;

        if is_reset_command(&message.body) {
            return self.reset(session_id).await;
        }

        if let Some(followup) = &self.followup {
            followup.touch(session_id);
        }

        if let Some(media) = &message.media {
            let path = serde_json::Value::String(media.display().to_string());
            if let Err(e) = self.store.update(session_id, LAST_MEDIA_KEY, path).await {
                tracing::warn!("Could not record media for {}: {}", session_id, e);
            }
        }

        let gateway = self.processor.gateway();
        let agent = gateway.sessions().assigned_agent(session_id);
        let Some(reply) = gateway.call(&agent, &message.body, session_id).await else {
            tracing::warn!("No reply from {} for {}, turn dropped", agent, session_id);
            return Ok(());
        };

        match self.router.classify(&reply) {
            Some(RouteDecision::Agent(next)) if next != agent => {
                self.hand_off(session_id, &agent, &next, &reply).await?;
            }
            Some(decision) => {
                tracing::debug!(
                    "Routing signal '{}' for {} kept on {}",
                    decision.as_str(),
                    session_id,
                    agent
                );
                let visible = self.router.strip_routing_artifacts(&reply);
                self.processor
                    .process(&visible, &ReplyTarget::new(session_id, &agent))
                    .await?;
            }
            None => {
                self.processor
                    .process(&reply, &ReplyTarget::new(session_id, &agent))
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::InboundMessage;
    use crate::testing::Fixture;

    fn pipeline(fx: &Fixture) -> MessagePipeline {
        MessagePipeline::new(
            fx.processor.clone(),
            Router::from_settings(&fx.settings),
            fx.store.clone(),
        )
    }

    fn entry(body: &str) -> QueueEntry {
        QueueEntry::new(InboundMessage::text("u1", body))
    }

    #[test]
    fn test_reset_commands() {
        assert!(is_reset_command("#reset"));
        assert!(is_reset_command("  #CERRAR "));
        assert!(!is_reset_command("please #reset"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_plain_reply_is_delivered() {
        let fx = Fixture::new();
        fx.backend.reply_with(|_, _| Some("Bienvenido".to_string()));

        pipeline(&fx).process(entry("hola")).await.unwrap();

        assert_eq!(fx.backend.calls_to("agent-1"), vec!["hola"]);
        assert_eq!(fx.delivery.texts_for("u1"), vec!["Bienvenido"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hand_off_reassigns_and_forwards_summary() {
        let fx = Fixture::new();
        fx.backend.reply_with(|agent, msg| match agent {
            "agent-1" => Some(format!(
                "Great, a specialist will help you.\nderiving to agent-2\nGET_SUMMARY: wants {}",
                msg
            )),
            _ => Some("Hi, I'm the specialist.".to_string()),
        });

        pipeline(&fx).process(entry("product X")).await.unwrap();

        assert_eq!(fx.sessions.assigned_agent("u1"), "agent-2");
        assert_eq!(
            fx.backend.calls_to("agent-2"),
            vec!["GET_SUMMARY: wants product X"]
        );
        assert_eq!(
            fx.delivery.texts_for("u1"),
            vec!["Great, a specialist will help you.", "Hi, I'm the specialist."]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ambiguous_route_keeps_assignment() {
        let fx = Fixture::new();
        fx.backend
            .reply_with(|_, _| Some("One moment.\nderiving to someone".to_string()));

        pipeline(&fx).process(entry("help")).await.unwrap();

        assert_eq!(fx.sessions.assigned_agent("u1"), "agent-1");
        assert_eq!(fx.delivery.texts_for("u1"), vec!["One moment."]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reply_ends_turn_silently() {
        let fx = Fixture::new();
        fx.backend.reply_with(|_, _| None);

        pipeline(&fx).process(entry("hola")).await.unwrap();

        assert!(fx.delivery.texts().is_empty());
        assert_eq!(fx.reporter.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_session_state() {
        let fx = Fixture::new();
        fx.sessions.assign("u1", "agent-3");
        fx.store
            .update("u1", LAST_MEDIA_KEY, serde_json::json!("/tmp/a.jpg"))
            .await
            .unwrap();

        pipeline(&fx).process(entry("#reset")).await.unwrap();

        assert!(fx.backend.calls().is_empty());
        assert_eq!(fx.sessions.assigned_agent("u1"), "agent-1");
        assert!(fx.sessions.thread_id("u1").is_none());
        assert!(fx.store.get("u1", LAST_MEDIA_KEY).await.unwrap().is_none());
        assert_eq!(fx.delivery.texts_for("u1"), vec![RESET_CONFIRMATION]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_media_path_is_recorded() {
        let fx = Fixture::new();
        fx.backend.reply_with(|_, _| Some("Nice photo!".to_string()));

        let message = InboundMessage::text("u1", "look").with_media("/tmp/u1/photo.jpg");
        pipeline(&fx)
            .process(QueueEntry::new(message))
            .await
            .unwrap();

        assert_eq!(
            fx.store.get("u1", LAST_MEDIA_KEY).await.unwrap(),
            Some(serde_json::json!("/tmp/u1/photo.jpg"))
        );
    }
}
