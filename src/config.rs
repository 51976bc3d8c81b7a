//! Configuration loading for Switchboard.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Get the Switchboard home directory (~/.switchboard).
pub fn get_home_dir() -> Result<PathBuf> {
    let home = directories::UserDirs::new()
        .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?;

    Ok(home.home_dir().join(".switchboard"))
}

/// Get the settings file path.
pub fn get_settings_path() -> Result<PathBuf> {
    Ok(get_home_dir()?.join("settings.json"))
}

/// Load settings from ~/.switchboard/settings.json
pub fn load_settings() -> Result<Settings> {
    let path = get_settings_path()?;

    if !path.exists() {
        return Err(Error::Config(format!(
            "Settings file not found at {}",
            path.display()
        )));
    }

    let content = std::fs::read_to_string(&path)?;
    let settings: Settings = serde_json::from_str(&content)?;
    validate_settings(&settings)?;

    tracing::debug!("Loaded settings from {}", path.display());
    Ok(settings)
}

/// Load settings or return default if not found.
pub fn load_settings_or_default() -> Settings {
    load_settings().unwrap_or_else(|e| {
        tracing::warn!("Failed to load settings: {}, using defaults", e);
        Settings::default()
    })
}

pub fn validate_settings(settings: &Settings) -> Result<()> {
    if settings.agents.is_empty() {
        return Err(Error::Config("agents roster is empty".to_string()));
    }
    let default_agent = &settings.routing.default_agent;
    if !settings.agents.iter().any(|a| &a.id == default_agent) {
        return Err(Error::Config(format!(
            "routing.default_agent '{}' not found in agents",
            default_agent
        )));
    }
    if settings.reconnection.nudges.is_empty() {
        return Err(Error::Config("reconnection.nudges is empty".to_string()));
    }
    if settings.reconnection.max_attempts == 0 {
        return Err(Error::Config(
            "reconnection.max_attempts must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// One reasoning agent in the roster.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct AgentConfig {
    pub id: String,
    pub name: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

impl AgentConfig {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            ..Default::default()
        }
    }
}

fn default_agents() -> Vec<AgentConfig> {
    ["agent-1", "agent-2", "agent-3"]
        .iter()
        .map(|id| AgentConfig::new(id))
        .collect()
}

/// Routing configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Routing {
    #[serde(default = "default_agent_id")]
    pub default_agent: String,
    #[serde(default = "default_summary_marker")]
    pub summary_marker: String,
    #[serde(default = "default_continuation")]
    pub default_continuation: String,
}

fn default_agent_id() -> String {
    "agent-1".to_string()
}

fn default_summary_marker() -> String {
    "GET_SUMMARY".to_string()
}

fn default_continuation() -> String {
    "Please continue the conversation with the user.".to_string()
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            default_agent: default_agent_id(),
            summary_marker: default_summary_marker(),
            default_continuation: default_continuation(),
        }
    }
}

/// Reasoning backend configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProviderSettings {
    #[serde(default = "default_provider_kind")]
    pub kind: String,
    pub base_url: Option<String>,
    pub default_model: Option<String>,
}

fn default_provider_kind() -> String {
    "ollama".to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            kind: default_provider_kind(),
            base_url: None,
            default_model: None,
        }
    }
}

/// Agent gateway configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Gateway {
    #[serde(default = "default_gateway_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_gateway_timeout_secs() -> u64 {
    40
}

impl Default for Gateway {
    fn default() -> Self {
        Self {
            timeout_secs: default_gateway_timeout_secs(),
        }
    }
}

impl Gateway {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Directive processing configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Directives {
    #[serde(default = "default_run_poll_attempts")]
    pub run_poll_attempts: u32,
    #[serde(default = "default_run_poll_interval_ms")]
    pub run_poll_interval_ms: u64,
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_chunk_delay_ms")]
    pub chunk_delay_ms: u64,
    #[serde(default = "default_pending_action_marker")]
    pub pending_action_marker: String,
    #[serde(default = "default_continuation_token")]
    pub continuation_token: String,
    #[serde(default = "default_confirmation_initial_wait_secs")]
    pub confirmation_initial_wait_secs: u64,
    #[serde(default = "default_confirmation_poll_secs")]
    pub confirmation_poll_secs: u64,
    #[serde(default = "default_confirmation_max_polls")]
    pub confirmation_max_polls: u32,
}

fn default_run_poll_attempts() -> u32 {
    20
}

fn default_run_poll_interval_ms() -> u64 {
    2000
}

fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_chunk_delay_ms() -> u64 {
    600
}

fn default_pending_action_marker() -> String {
    "Voy a proceder a realizar la reserva.".to_string()
}

fn default_continuation_token() -> String {
    "ok".to_string()
}

fn default_confirmation_initial_wait_secs() -> u64 {
    30
}

fn default_confirmation_poll_secs() -> u64 {
    10
}

fn default_confirmation_max_polls() -> u32 {
    12
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            run_poll_attempts: default_run_poll_attempts(),
            run_poll_interval_ms: default_run_poll_interval_ms(),
            settle_delay_ms: default_settle_delay_ms(),
            chunk_delay_ms: default_chunk_delay_ms(),
            pending_action_marker: default_pending_action_marker(),
            continuation_token: default_continuation_token(),
            confirmation_initial_wait_secs: default_confirmation_initial_wait_secs(),
            confirmation_poll_secs: default_confirmation_poll_secs(),
            confirmation_max_polls: default_confirmation_max_polls(),
        }
    }
}

/// Calendar action configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Calendar {
    #[serde(default = "default_utc_offset")]
    pub utc_offset: String,
    #[serde(default = "default_event_duration_minutes")]
    pub event_duration_minutes: i64,
}

fn default_utc_offset() -> String {
    "-03:00".to_string()
}

fn default_event_duration_minutes() -> i64 {
    60
}

impl Default for Calendar {
    fn default() -> Self {
        Self {
            utc_offset: default_utc_offset(),
            event_duration_minutes: default_event_duration_minutes(),
        }
    }
}

/// One row of the reconnection escalation table.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct NudgeStep {
    pub message: String,
    pub timeout_secs: u64,
}

impl NudgeStep {
    pub fn new(message: &str, timeout_secs: u64) -> Self {
        Self {
            message: message.to_string(),
            timeout_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reconnection cycle configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Reconnection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_greeting")]
    pub greeting: String,
    #[serde(default = "default_summary_request")]
    pub summary_request: String,
    #[serde(default = "default_required_field")]
    pub required_field: String,
    #[serde(default = "default_nudges")]
    pub nudges: Vec<NudgeStep>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_greeting() -> String {
    "hola".to_string()
}

fn default_summary_request() -> String {
    "GET_SUMMARY".to_string()
}

fn default_required_field() -> String {
    "name".to_string()
}

fn default_nudges() -> Vec<NudgeStep> {
    vec![
        NudgeStep::new("Are you still there? I can keep helping whenever you are ready.", 15 * 60),
        NudgeStep::new("Just checking in. Could you share your name so we can follow up?", 60 * 60),
        NudgeStep::new("We'll leave the conversation here for now. Write anytime to pick it up.", 60),
    ]
}

impl Default for Reconnection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            greeting: default_greeting(),
            summary_request: default_summary_request(),
            required_field: default_required_field(),
            nudges: default_nudges(),
        }
    }
}

impl Reconnection {
    /// Escalation row for a 1-indexed attempt; the last row is reused past the end.
    pub fn step(&self, attempt: u32) -> Option<&NudgeStep> {
        let idx = (attempt.max(1) - 1) as usize;
        self.nudges.get(idx).or_else(|| self.nudges.last())
    }
}

/// Idle follow-up configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct FollowUp {
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    pub report_chat: Option<String>,
    pub secondary_report_chat: Option<String>,
    #[serde(default = "default_media_flag_field")]
    pub media_flag_field: String,
}

fn default_idle_timeout_secs() -> u64 {
    10 * 60
}

fn default_media_flag_field() -> String {
    "photo_or_video".to_string()
}

impl Default for FollowUp {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            report_chat: None,
            secondary_report_chat: None,
            media_flag_field: default_media_flag_field(),
        }
    }
}

/// Channel configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ChannelConfig {
    pub bot_token: Option<String>,
}

/// Channels configuration.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Channels {
    #[serde(default)]
    pub telegram: ChannelConfig,
    /// Chat that receives operator-facing failure reports.
    pub operator_chat: Option<String>,
    /// Template for the contact link attached to reports; `{user}` is replaced.
    #[serde(default = "default_contact_link_template")]
    pub contact_link_template: String,
}

fn default_contact_link_template() -> String {
    "tg://user?id={user}".to_string()
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            telegram: ChannelConfig::default(),
            operator_chat: None,
            contact_link_template: default_contact_link_template(),
        }
    }
}

impl Channels {
    pub fn contact_link(&self, user_id: &str) -> String {
        self.contact_link_template.replace("{user}", user_id)
    }
}

/// Storage configuration.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Storage {
    pub database_path: Option<PathBuf>,
}

impl Storage {
    /// Resolve the database path, defaulting to ~/.switchboard/switchboard.db.
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_home_dir()?.join("switchboard.db")),
        }
    }
}

/// Switchboard settings.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Settings {
    #[serde(default = "default_agents")]
    pub agents: Vec<AgentConfig>,

    #[serde(default)]
    pub routing: Routing,

    #[serde(default)]
    pub provider: ProviderSettings,

    #[serde(default)]
    pub gateway: Gateway,

    #[serde(default)]
    pub directives: Directives,

    #[serde(default)]
    pub calendar: Calendar,

    #[serde(default)]
    pub reconnection: Reconnection,

    #[serde(default)]
    pub followup: FollowUp,

    #[serde(default)]
    pub channels: Channels,

    #[serde(default)]
    pub storage: Storage,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            agents: default_agents(),
            routing: Routing::default(),
            provider: ProviderSettings::default(),
            gateway: Gateway::default(),
            directives: Directives::default(),
            calendar: Calendar::default(),
            reconnection: Reconnection::default(),
            followup: FollowUp::default(),
            channels: Channels::default(),
            storage: Storage::default(),
        }
    }
}

impl Settings {
    /// Agent ids in priority order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.id.clone()).collect()
    }

    pub fn agent(&self, id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == id)
    }
}
