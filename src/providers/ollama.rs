//! Ollama HTTP backend.
//!
//! Ollama's chat API is stateless, so threads are kept in memory: each thread
//! is the message history replayed on every call, with the system prompt of
//! whichever agent is being invoked.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use super::provider::{AgentBackend, ProviderError, Result};
use crate::config::AgentConfig;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";
const DEFAULT_MODEL: &str = "llama3.2";

pub struct OllamaBackend {
    client: Client,
    base_url: String,
    default_model: String,
    agents: HashMap<String, AgentConfig>,
    threads: Mutex<HashMap<String, Vec<Message>>>,
    running: Mutex<HashSet<String>>,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
struct Message {
    role: String,
    content: String,
}

impl Message {
    fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Marks a thread as running for the lifetime of the guard.
struct RunGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    thread_id: String,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.thread_id);
        }
    }
}

impl OllamaBackend {
    pub fn new(agents: &[AgentConfig]) -> Self {
        Self::with_base_url(DEFAULT_BASE_URL, agents)
    }

    pub fn with_base_url(base_url: impl Into<String>, agents: &[AgentConfig]) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            default_model: DEFAULT_MODEL.to_string(),
            agents: agents.iter().map(|a| (a.id.clone(), a.clone())).collect(),
            threads: Mutex::new(HashMap::new()),
            running: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn history(&self, thread_id: &str) -> Result<Vec<Message>> {
        let threads = self
            .threads
            .lock()
            .map_err(|_| ProviderError::other("thread map poisoned"))?;
        threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownThread(thread_id.to_string()))
    }

    fn append(&self, thread_id: &str, messages: &[Message]) -> Result<()> {
        let mut threads = self
            .threads
            .lock()
            .map_err(|_| ProviderError::other("thread map poisoned"))?;
        threads
            .entry(thread_id.to_string())
            .or_default()
            .extend_from_slice(messages);
        Ok(())
    }

    fn mark_running(&self, thread_id: &str) -> Result<RunGuard<'_>> {
        self.running
            .lock()
            .map_err(|_| ProviderError::other("run set poisoned"))?
            .insert(thread_id.to_string());
        Ok(RunGuard {
            running: &self.running,
            thread_id: thread_id.to_string(),
        })
    }
}

#[async_trait]
impl AgentBackend for OllamaBackend {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn open_thread(&self) -> Result<String> {
        let thread_id = ulid::Ulid::new().to_string();
        self.append(&thread_id, &[])?;
        tracing::debug!("Opened ollama thread {}", thread_id);
        Ok(thread_id)
    }

    async fn invoke(&self, agent_id: &str, message: &str, thread_id: &str) -> Result<String> {
        let agent = self
            .agents
            .get(agent_id)
            .ok_or_else(|| ProviderError::UnknownAgent(agent_id.to_string()))?;
        let model = agent.model.as_deref().unwrap_or(&self.default_model);

        let history = self.history(thread_id)?;
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = &agent.system_prompt {
            messages.push(Message::new("system", prompt));
        }
        messages.extend(history);
        messages.push(Message::new("user", message));

        let request = ChatRequest {
            model: model.to_string(),
            messages,
            stream: false,
        };

        let _guard = self.mark_running(thread_id)?;
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ProviderError::ApiError(format!(
                "ollama returned {}",
                response.status()
            )));
        }

        let chat_response: ChatResponse = response.json().await?;
        let reply = chat_response.message.content;

        self.append(
            thread_id,
            &[Message::new("user", message), Message::new("assistant", &reply)],
        )?;

        Ok(reply)
    }

    async fn is_running(&self, thread_id: &str) -> Result<bool> {
        let running = self
            .running
            .lock()
            .map_err(|_| ProviderError::other("run set poisoned"))?;
        Ok(running.contains(thread_id))
    }
}
