//! Scriptable collaborators shared by unit tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::agent::{AgentGateway, GatewayConfig};
use crate::channel::{Delivery, ErrorReporter, InboundBus};
use crate::config::Settings;
use crate::core::conversation::SessionRegistry;
use crate::directive::actions::{CalendarBackend, DataBackend, EventUpdate, EventWindow, NewEvent};
use crate::directive::processor::{DirectiveProcessor, ProcessorConfig};
use crate::error::{Error, Result};
use crate::followup::SummaryExporter;
use crate::providers::{AgentBackend, ProviderError};
use crate::store::MemoryStateStore;
use crate::summary::SummaryData;

type Responder = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

#[derive(Default)]
struct Script {
    responder: Option<Responder>,
    delayed: Option<(Duration, String)>,
    fail: bool,
    running_polls: u32,
    latency: Duration,
    calls: Vec<(String, String)>,
    threads: usize,
}

/// Counts an invocation as in flight until dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Agent backend driven by a closure. A `None` reply never settles.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    running_checks: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply_with<F>(&self, f: F)
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.script.lock().unwrap().responder = Some(Arc::new(f));
    }

    /// The next call replies after `delay`; later calls use the responder.
    pub fn reply_after(&self, delay: Duration, text: &str) {
        self.script.lock().unwrap().delayed = Some((delay, text.to_string()));
    }

    /// Every reply takes `latency` to arrive.
    pub fn set_latency(&self, latency: Duration) {
        self.script.lock().unwrap().latency = latency;
    }

    /// Most invocations ever in flight at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn fail_always(&self) {
        self.script.lock().unwrap().fail = true;
    }

    /// Report a run in progress for the next `polls` checks.
    pub fn set_running(&self, polls: u32) {
        self.script.lock().unwrap().running_polls = polls;
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.calls().into_iter().map(|(_, m)| m).collect()
    }

    pub fn calls_with(&self, message: &str) -> usize {
        self.calls().iter().filter(|(_, m)| m == message).count()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|(_, m)| m.starts_with(prefix)).count()
    }

    pub fn calls_to(&self, agent_id: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|(a, _)| a == agent_id)
            .map(|(_, m)| m)
            .collect()
    }

    pub fn running_checks(&self) -> usize {
        self.running_checks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open_thread(&self) -> crate::providers::Result<String> {
        let mut script = self.script.lock().unwrap();
        script.threads += 1;
        Ok(format!("thread-{}", script.threads))
    }

    async fn invoke(
        &self,
        agent_id: &str,
        message: &str,
        _thread_id: &str,
    ) -> crate::providers::Result<String> {
        let (fail, delayed, responder, latency) = {
            let mut script = self.script.lock().unwrap();
            script.calls.push((agent_id.to_string(), message.to_string()));
            (
                script.fail,
                script.delayed.take(),
                script.responder.clone(),
                script.latency,
            )
        };
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if fail {
            return Err(ProviderError::ApiError("scripted failure".to_string()));
        }
        if let Some((delay, text)) = delayed {
            tokio::time::sleep(delay).await;
            return Ok(text);
        }
        match responder.and_then(|f| f(agent_id, message)) {
            Some(text) => Ok(text),
            None => std::future::pending().await,
        }
    }

    async fn is_running(&self, _thread_id: &str) -> crate::providers::Result<bool> {
        self.running_checks.fetch_add(1, Ordering::SeqCst);
        let mut script = self.script.lock().unwrap();
        if script.running_polls > 0 {
            script.running_polls -= 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<(String, String, String)>>,
}

impl RecordingReporter {
    pub fn count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn reports(&self) -> Vec<(String, String, String)> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl ErrorReporter for RecordingReporter {
    async fn report(&self, error: &str, user_id: &str, contact_link: &str) {
        self.reports.lock().unwrap().push((
            error.to_string(),
            user_id.to_string(),
            contact_link.to_string(),
        ));
    }
}

#[derive(Default)]
pub struct RecordingDelivery {
    texts: Mutex<Vec<(String, String)>>,
    media: Mutex<Vec<(String, PathBuf)>>,
}

impl RecordingDelivery {
    pub fn texts(&self) -> Vec<(String, String)> {
        self.texts.lock().unwrap().clone()
    }

    pub fn texts_for(&self, session_id: &str) -> Vec<String> {
        self.texts()
            .into_iter()
            .filter(|(s, _)| s == session_id)
            .map(|(_, t)| t)
            .collect()
    }

    pub fn media(&self) -> Vec<(String, PathBuf)> {
        self.media.lock().unwrap().clone()
    }
}

#[async_trait]
impl Delivery for RecordingDelivery {
    async fn deliver(&self, session_id: &str, text: &str) -> Result<()> {
        self.texts
            .lock()
            .unwrap()
            .push((session_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn deliver_media(&self, session_id: &str, path: &Path) -> Result<()> {
        self.media
            .lock()
            .unwrap()
            .push((session_id.to_string(), path.to_path_buf()));
        Ok(())
    }
}

/// Data backend that records queries and answers with a fixed result.
pub struct FakeData {
    queries: Mutex<Vec<String>>,
    fail: AtomicBool,
    result: String,
}

impl Default for FakeData {
    fn default() -> Self {
        Self {
            queries: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            result: r#"[{"id":1}]"#.to_string(),
        }
    }
}

impl FakeData {
    pub fn failing() -> Self {
        let data = Self::default();
        data.fail.store(true, Ordering::SeqCst);
        data
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataBackend for FakeData {
    async fn execute_query(&self, sql: &str) -> Result<String> {
        self.queries.lock().unwrap().push(sql.to_string());
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Store("relation does not exist".to_string()));
        }
        Ok(self.result.clone())
    }
}

/// Calendar backend that records calls by name.
#[derive(Default)]
pub struct FakeCalendar {
    calls: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl FakeCalendar {
    pub fn failing() -> Self {
        let calendar = Self::default();
        calendar.fail.store(true, Ordering::SeqCst);
        calendar
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) -> Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Calendar("calendar unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarBackend for FakeCalendar {
    async fn create_event(&self, window: &EventWindow, event: &NewEvent) -> Result<Value> {
        self.record(format!("create {} {}", window.start.to_rfc3339(), event.title))?;
        Ok(json!({ "status": "confirmed", "id": "evt-1" }))
    }

    async fn check_availability(&self, window: &EventWindow) -> Result<Value> {
        self.record(format!("available {}", window.start.to_rfc3339()))?;
        Ok(json!({ "available": true }))
    }

    async fn update_event(
        &self,
        id: &str,
        _window: Option<&EventWindow>,
        _update: &EventUpdate,
    ) -> Result<Value> {
        self.record(format!("update {}", id))?;
        Ok(json!({ "status": "updated", "id": id }))
    }

    async fn delete_event(&self, id: &str) -> Result<Value> {
        self.record(format!("delete {}", id))?;
        Ok(json!({ "status": "cancelled", "id": id }))
    }
}

#[derive(Default)]
pub struct RecordingExporter {
    exported: Mutex<Vec<(String, SummaryData)>>,
}

impl RecordingExporter {
    pub fn exported(&self) -> Vec<(String, SummaryData)> {
        self.exported.lock().unwrap().clone()
    }
}

#[async_trait]
impl SummaryExporter for RecordingExporter {
    async fn export(&self, session_id: &str, summary: &SummaryData) -> Result<()> {
        self.exported
            .lock()
            .unwrap()
            .push((session_id.to_string(), summary.clone()));
        Ok(())
    }
}

/// Fully wired collaborators around a scripted backend.
///
/// Session `u1` already has a thread, so no priming message is sent for it.
pub struct Fixture {
    pub settings: Settings,
    pub backend: Arc<ScriptedBackend>,
    pub reporter: Arc<RecordingReporter>,
    pub delivery: Arc<RecordingDelivery>,
    pub data: Arc<FakeData>,
    pub calendar: Arc<FakeCalendar>,
    pub exporter: Arc<RecordingExporter>,
    pub sessions: Arc<SessionRegistry>,
    pub gateway: Arc<AgentGateway>,
    pub processor: Arc<DirectiveProcessor>,
    pub store: Arc<MemoryStateStore>,
    pub bus: InboundBus,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let backend = Arc::new(ScriptedBackend::new());
        let reporter = Arc::new(RecordingReporter::default());
        let delivery = Arc::new(RecordingDelivery::default());
        let data = Arc::new(FakeData::default());
        let calendar = Arc::new(FakeCalendar::default());
        let sessions = Arc::new(SessionRegistry::new(&settings.routing.default_agent));
        sessions.set_thread_id("u1", "thread-u1");

        let gateway = Arc::new(AgentGateway::new(
            backend.clone(),
            sessions.clone(),
            reporter.clone(),
            GatewayConfig::from_settings(&settings),
        ));
        let processor = Arc::new(DirectiveProcessor::new(
            gateway.clone(),
            data.clone(),
            calendar.clone(),
            delivery.clone(),
            ProcessorConfig::from_settings(&settings),
        ));

        Self {
            settings,
            backend,
            reporter,
            delivery,
            data,
            calendar,
            exporter: Arc::new(RecordingExporter::default()),
            sessions,
            gateway,
            processor,
            store: Arc::new(MemoryStateStore::new()),
            bus: InboundBus::new(),
        }
    }
}
