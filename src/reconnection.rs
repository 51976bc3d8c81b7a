//! Re-engagement of a silent user.
//!
//! The controller sends escalating nudges and waits for the user after each
//! one. A reply, or a summary that turns out to hold the required field, ends
//! the cycle successfully; running out of attempts ends it as a failure.
//! Progress is persisted after every nudge so a restarted process can resume
//! waiting instead of nudging twice.
//!
//! While the cycle runs, the session's inbound messages are diverted to it.
//! Whatever it does not consume is handed back to the queue when it ends.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::task::JoinHandle;

use crate::channel::{InboundBus, InboundMessage};
use crate::config::Reconnection;
use crate::directive::{DirectiveProcessor, ReplyTarget};
use crate::store::{self, StateStore, RECONNECTION_KEY};
use crate::summary::SummaryData;

/// Persisted progress of a reconnection cycle.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectionState {
    pub attempts_made: u32,
}

/// Terminal state of a cycle, with the last summary the agent produced.
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectionOutcome {
    Success {
        attempt: u32,
        summary: Option<SummaryData>,
    },
    Failed {
        attempts: u32,
        summary: Option<SummaryData>,
    },
}

impl ReconnectionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ReconnectionOutcome::Success { .. })
    }

    pub fn summary(&self) -> Option<&SummaryData> {
        match self {
            ReconnectionOutcome::Success { summary, .. }
            | ReconnectionOutcome::Failed { summary, .. } => summary.as_ref(),
        }
    }
}

pub struct ReconnectionController {
    session_id: String,
    processor: Arc<DirectiveProcessor>,
    store: Arc<dyn StateStore>,
    bus: InboundBus,
    config: Reconnection,
    resume: bool,
}

impl ReconnectionController {
    pub fn new(
        session_id: &str,
        processor: Arc<DirectiveProcessor>,
        store: Arc<dyn StateStore>,
        bus: InboundBus,
        config: Reconnection,
    ) -> Self {
        Self {
            session_id: session_id.to_string(),
            processor,
            store,
            bus,
            config,
            resume: false,
        }
    }

    /// Continue from persisted progress instead of starting at attempt 1.
    pub fn resuming(mut self) -> Self {
        self.resume = true;
        self
    }

    /// Run the cycle in the background and invoke exactly one callback with
    /// the last summary.
    ///
    /// The session is diverted before this returns, so no message sent after
    /// it can reach the queue while the cycle runs.
    pub fn start<S, SF, F, FF>(self, on_success: S, on_fail: F) -> JoinHandle<ReconnectionOutcome>
    where
        S: FnOnce(Option<SummaryData>) -> SF + Send + 'static,
        SF: Future<Output = ()> + Send,
        F: FnOnce(Option<SummaryData>) -> FF + Send + 'static,
        FF: Future<Output = ()> + Send,
    {
        let inbound = self.begin();
        tokio::spawn(async move {
            let outcome = self.drive(inbound).await;
            let summary = outcome.summary().cloned();
            if outcome.is_success() {
                on_success(summary).await;
            } else {
                on_fail(summary).await;
            }
            outcome
        })
    }

    /// Drive the cycle to a terminal state.
    pub async fn run(&self) -> ReconnectionOutcome {
        let inbound = self.begin();
        self.drive(inbound).await
    }

    /// Subscribe, then divert. The other order could publish into the void.
    fn begin(&self) -> broadcast::Receiver<InboundMessage> {
        let inbound = self.bus.subscribe();
        self.processor
            .gateway()
            .sessions()
            .set_reconnecting(&self.session_id, true);
        inbound
    }

    async fn drive(&self, mut inbound: broadcast::Receiver<InboundMessage>) -> ReconnectionOutcome {
        let max_attempts = self.config.max_attempts.max(1);
        let mut held = Vec::new();

        let resumed = if self.resume { self.load_state().await } else { None };
        let (mut attempt, mut send_nudge) = match resumed {
            Some(state) if state.attempts_made >= 1 => {
                tracing::info!(
                    "Resuming reconnection for {} after attempt {}",
                    self.session_id,
                    state.attempts_made
                );
                (state.attempts_made.min(max_attempts), false)
            }
            _ => (1, true),
        };

        let outcome = loop {
            if send_nudge {
                self.nudge(attempt).await;
            }
            send_nudge = true;

            let wait = self
                .config
                .step(attempt)
                .map(|s| s.timeout())
                .unwrap_or(Duration::from_secs(60));

            match self.wait_for_user(&mut inbound, wait, &mut held).await {
                Some(message) => {
                    tracing::info!(
                        "User {} answered reconnection attempt {}",
                        self.session_id,
                        attempt
                    );
                    self.forward(&message).await;
                    let summary = self.request_summary().await;
                    break ReconnectionOutcome::Success { attempt, summary };
                }
                None => {
                    let summary = self.request_summary().await;
                    if summary
                        .as_ref()
                        .map_or(false, |s| s.has_field(&self.config.required_field))
                    {
                        tracing::info!(
                            "Summary for {} now holds '{}', reconnection done",
                            self.session_id,
                            self.config.required_field
                        );
                        break ReconnectionOutcome::Success { attempt, summary };
                    }
                    if attempt >= max_attempts {
                        break ReconnectionOutcome::Failed {
                            attempts: attempt,
                            summary,
                        };
                    }
                    attempt += 1;
                }
            }
        };

        if let Err(e) = self.store.remove(&self.session_id, RECONNECTION_KEY).await {
            tracing::warn!("Could not clear reconnection state for {}: {}", self.session_id, e);
        }
        self.finish(inbound, held);

        tracing::info!("Reconnection for {} ended: {:?}", self.session_id, outcome);
        outcome
    }

    /// Stop diverting and hand back every diverted message not consumed.
    ///
    /// The flag is cleared first; diversion happens under the same lock, so
    /// the receiver already holds everything that was diverted.
    fn finish(&self, mut inbound: broadcast::Receiver<InboundMessage>, held: Vec<InboundMessage>) {
        self.processor
            .gateway()
            .sessions()
            .set_reconnecting(&self.session_id, false);

        let mut leftover = held;
        loop {
            match inbound.try_recv() {
                Ok(message) if message.from == self.session_id => leftover.push(message),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!("Reconnection listener skipped {} messages", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }

        if !leftover.is_empty() {
            tracing::info!(
                "Handing {} message(s) from {} back to the queue",
                leftover.len(),
                self.session_id
            );
        }
        for message in leftover {
            self.bus.requeue(message);
        }
    }

    async fn load_state(&self) -> Option<ReconnectionState> {
        match store::load(self.store.as_ref(), &self.session_id, RECONNECTION_KEY).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Could not read reconnection state for {}: {}", self.session_id, e);
                None
            }
        }
    }

    async fn nudge(&self, attempt: u32) {
        let state = ReconnectionState {
            attempts_made: attempt,
        };
        if let Err(e) = store::save(self.store.as_ref(), &self.session_id, RECONNECTION_KEY, &state).await {
            tracing::warn!("Could not persist reconnection state for {}: {}", self.session_id, e);
        }

        let Some(step) = self.config.step(attempt) else {
            return;
        };
        tracing::info!("Reconnection attempt {} for {}", attempt, self.session_id);
        if let Err(e) = self
            .processor
            .delivery()
            .deliver(&self.session_id, &step.message)
            .await
        {
            tracing::error!("Failed to deliver nudge to {}: {}", self.session_id, e);
        }
    }

    /// First qualifying message from this user within `wait`. Other messages
    /// from the user land in `held`.
    async fn wait_for_user(
        &self,
        inbound: &mut broadcast::Receiver<InboundMessage>,
        wait: Duration,
        held: &mut Vec<InboundMessage>,
    ) -> Option<InboundMessage> {
        let listen = async {
            loop {
                match inbound.recv().await {
                    Ok(message) if message.from != self.session_id => continue,
                    Ok(message) if message.is_qualifying() => return message,
                    Ok(message) => held.push(message),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("Reconnection listener skipped {} messages", skipped);
                    }
                    Err(RecvError::Closed) => std::future::pending::<()>().await,
                }
            }
        };
        tokio::time::timeout(wait, listen).await.ok()
    }

    fn agent(&self) -> String {
        self.processor
            .gateway()
            .sessions()
            .assigned_agent(&self.session_id)
    }

    async fn forward(&self, message: &InboundMessage) {
        let agent = self.agent();
        let text = format!("{}, {}", self.config.greeting, message.body);
        let Some(reply) = self
            .processor
            .gateway()
            .call(&agent, &text, &self.session_id)
            .await
        else {
            return;
        };
        let target = ReplyTarget::new(&self.session_id, &agent);
        if let Err(e) = self.processor.process(&reply, &target).await {
            tracing::error!("Failed to deliver reply to {}: {}", self.session_id, e);
        }
    }

    async fn request_summary(&self) -> Option<SummaryData> {
        let agent = self.agent();
        self.processor
            .gateway()
            .call(&agent, &self.config.summary_request, &self.session_id)
            .await
            .map(|reply| SummaryData::parse(&reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const NUDGE_1: &str = "Are you still there? I can keep helping whenever you are ready.";
    const NUDGE_2: &str = "Just checking in. Could you share your name so we can follow up?";
    const NUDGE_3: &str = "We'll leave the conversation here for now. Write anytime to pick it up.";

    fn fixture(summary: &'static str) -> Fixture {
        let fx = Fixture::new();
        fx.backend.reply_with(move |_, msg| {
            if msg == "GET_SUMMARY" {
                Some(summary.to_string())
            } else {
                Some(format!("Welcome back! ({})", msg))
            }
        });
        fx
    }

    fn controller(fx: &Fixture) -> ReconnectionController {
        ReconnectionController::new(
            "u1",
            fx.processor.clone(),
            fx.store.clone(),
            fx.bus.clone(),
            fx.settings.reconnection.clone(),
        )
    }

    /// Deliver the way the router does: only while the session is diverted.
    fn send(fx: &Fixture, message: InboundMessage) -> bool {
        fx.sessions
            .divert_if_reconnecting(&message.from, || fx.bus.publish(&message))
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_user_gets_three_nudges_then_fails() {
        let fx = fixture("- name: \n- phone: 555");
        let successes = Arc::new(AtomicUsize::new(0));
        let failed_with = Arc::new(Mutex::new(None));
        let (s, f) = (successes.clone(), failed_with.clone());

        let outcome = controller(&fx)
            .start(
                move |_| async move {
                    s.fetch_add(1, Ordering::SeqCst);
                },
                move |summary| async move {
                    *f.lock().unwrap() = Some(summary);
                },
            )
            .await
            .unwrap();

        let last = SummaryData::parse("- name: \n- phone: 555");
        assert_eq!(
            outcome,
            ReconnectionOutcome::Failed {
                attempts: 3,
                summary: Some(last.clone())
            }
        );
        assert_eq!(fx.delivery.texts_for("u1"), vec![NUDGE_1, NUDGE_2, NUDGE_3]);
        assert_eq!(fx.backend.calls_with("GET_SUMMARY"), 3);
        assert_eq!(successes.load(Ordering::SeqCst), 0);
        assert_eq!(*failed_with.lock().unwrap(), Some(Some(last)));
        assert!(fx.store.get("u1", RECONNECTION_KEY).await.unwrap().is_none());
        assert!(!fx.sessions.is_reconnecting("u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_during_second_attempt_succeeds() {
        let fx = Fixture::new();
        let answered = Arc::new(AtomicUsize::new(0));
        let seen = answered.clone();
        fx.backend.reply_with(move |_, msg| {
            if msg == "GET_SUMMARY" {
                let name = if seen.load(Ordering::SeqCst) > 0 { "Ana" } else { "" };
                Some(format!("- name: {}", name))
            } else {
                seen.fetch_add(1, Ordering::SeqCst);
                Some(format!("Welcome back! ({})", msg))
            }
        });
        let succeeded_with = Arc::new(Mutex::new(None));
        let s = succeeded_with.clone();
        let handle = controller(&fx).start(
            move |summary| async move {
                *s.lock().unwrap() = Some(summary);
            },
            |_| async {},
        );
        assert!(fx.sessions.is_reconnecting("u1"));

        // First nudge times out after 15 minutes; the second is then pending.
        tokio::time::sleep(Duration::from_secs(15 * 60 + 30)).await;

        let mut group = InboundMessage::text("u1", "ignored");
        group.is_group = true;
        fx.bus.publish(&group);
        fx.bus.publish(&InboundMessage::text("u2", "other user"));
        assert!(send(&fx, InboundMessage::text("u1", "sorry, I was busy")));

        let outcome = handle.await.unwrap();

        assert!(matches!(outcome, ReconnectionOutcome::Success { attempt: 2, .. }));
        assert_eq!(fx.backend.calls_with("hola, sorry, I was busy"), 1);
        assert_eq!(
            fx.delivery.texts_for("u1"),
            vec![
                NUDGE_1,
                NUDGE_2,
                "Welcome back! (hola, sorry, I was busy)"
            ]
        );
        let data = succeeded_with.lock().unwrap().clone().flatten().unwrap();
        assert_eq!(data.get("name"), Some("Ana"));
        assert!(fx.store.get("u1", RECONNECTION_KEY).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unconsumed_messages_go_back_to_the_queue() {
        let fx = fixture("- name:");
        fx.backend.set_latency(Duration::from_secs(30));
        let mut requeued = fx.bus.take_requeued().unwrap();
        let handle = controller(&fx).start(|_| async {}, |_| async {});

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(send(&fx, InboundMessage::text("u1", "").with_media("/tmp/u1.jpg")));
        assert!(send(&fx, InboundMessage::text("u1", "first")));

        // The reply is being forwarded; this one arrives meanwhile.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(send(&fx, InboundMessage::text("u1", "second")));

        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, ReconnectionOutcome::Success { attempt: 1, .. }));
        assert!(!send(&fx, InboundMessage::text("u1", "third")));

        let media = requeued.try_recv().unwrap();
        assert_eq!(media.media.as_deref(), Some(std::path::Path::new("/tmp/u1.jpg")));
        assert_eq!(requeued.try_recv().unwrap().body, "second");
        assert!(requeued.try_recv().is_err());
        assert_eq!(fx.backend.calls_with("second"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_sends_only_the_remaining_nudge() {
        let fx = fixture("- name:");
        store::save(
            fx.store.as_ref(),
            "u1",
            RECONNECTION_KEY,
            &ReconnectionState { attempts_made: 2 },
        )
        .await
        .unwrap();

        let outcome = controller(&fx).resuming().run().await;

        assert!(matches!(outcome, ReconnectionOutcome::Failed { attempts: 3, .. }));
        assert_eq!(fx.delivery.texts_for("u1"), vec![NUDGE_3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_cycle_ignores_stale_progress() {
        let fx = fixture("- name:");
        store::save(
            fx.store.as_ref(),
            "u1",
            RECONNECTION_KEY,
            &ReconnectionState { attempts_made: 3 },
        )
        .await
        .unwrap();

        let outcome = controller(&fx).run().await;

        assert!(matches!(outcome, ReconnectionOutcome::Failed { attempts: 3, .. }));
        assert_eq!(fx.delivery.texts_for("u1"), vec![NUDGE_1, NUDGE_2, NUDGE_3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summary_with_required_field_ends_cycle() {
        let fx = fixture("- name: Ana\n- phone: 555");

        let outcome = controller(&fx).run().await;

        assert_eq!(
            outcome,
            ReconnectionOutcome::Success {
                attempt: 1,
                summary: Some(SummaryData::parse("- name: Ana\n- phone: 555"))
            }
        );
        assert_eq!(fx.delivery.texts_for("u1"), vec![NUDGE_1]);
    }
}
