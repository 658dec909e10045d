//! Shared fixtures: a scripted [`ChatModel`] and agent builders.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use termpilot_agent::agent::compress::COMPRESSION_PROMPT;
use termpilot_agent::llm::types::TokenUsage;
use termpilot_agent::{
    Agent, AgentConfig, AgentError, ChatModel, ChatRequest, ChatResponse, ChunkSink, MemoryConfig,
    MemoryManager, Result, StreamChunk, ToolRegistry,
};
use termpilot_agent::tools::ToolExecutor;

/// One scripted model reply.
pub enum Outcome {
    Reply(ChatResponse),
    Fail(AgentError),
    /// Never produce a byte until canceled.
    Stall,
}

impl Outcome {
    pub fn text(text: &str) -> Self {
        Self::Reply(ChatResponse::text(text).with_usage(TokenUsage::new(10, 5)))
    }
}

/// A model that replays scripted outcomes.
///
/// Outcomes queued for a specific model id are used first; the shared
/// queue serves every model. When both are empty the model answers with
/// `idle_reply`.
pub struct ScriptedModel {
    per_model: Mutex<HashMap<String, VecDeque<Outcome>>>,
    shared: Mutex<VecDeque<Outcome>>,
    idle_reply: Option<String>,
    summary: String,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub summaries: Mutex<Vec<ChatRequest>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self {
            per_model: Mutex::new(HashMap::new()),
            shared: Mutex::new(VecDeque::new()),
            idle_reply: None,
            summary: "summary S".into(),
            requests: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
        }
    }

    pub fn idle_reply(mut self, text: &str) -> Self {
        self.idle_reply = Some(text.to_owned());
        self
    }

    pub fn summary(mut self, text: &str) -> Self {
        self.summary = text.to_owned();
        self
    }

    pub fn then(self, outcome: Outcome) -> Self {
        self.shared.lock().unwrap().push_back(outcome);
        self
    }

    pub fn on(self, model: &str, outcome: Outcome) -> Self {
        self.per_model
            .lock()
            .unwrap()
            .entry(model.to_owned())
            .or_default()
            .push_back(outcome);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn models_called(&self) -> Vec<String> {
        self.requests.lock().unwrap().iter().map(|r| r.model.clone()).collect()
    }

    fn next(&self, model: &str) -> Option<Outcome> {
        if let Some(q) = self.per_model.lock().unwrap().get_mut(model)
            && let Some(o) = q.pop_front()
        {
            return Some(o);
        }
        self.shared.lock().unwrap().pop_front()
    }

    fn is_summary(request: &ChatRequest) -> bool {
        request
            .messages
            .iter()
            .any(|m| m.content.starts_with(COMPRESSION_PROMPT))
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &ChatRequest, cancel: &CancellationToken) -> Result<ChatResponse> {
        if Self::is_summary(request) {
            self.summaries.lock().unwrap().push(request.clone());
            return Ok(ChatResponse::text(self.summary.clone()).with_usage(TokenUsage::new(50, 5)));
        }
        let mut ignore = |_: StreamChunk| {};
        self.stream(request, &mut ignore, cancel).await
    }

    async fn stream(
        &self,
        request: &ChatRequest,
        on_chunk: ChunkSink<'_>,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }
        let outcome = self.next(&request.model).or_else(|| self.idle_reply.as_deref().map(Outcome::text));
        match outcome {
            Some(Outcome::Reply(response)) => {
                for call in &response.message.tool_calls {
                    on_chunk(StreamChunk::ToolCallStarted {
                        id: call.id.clone(),
                        name: call.name.clone(),
                    });
                }
                if !response.message.content.is_empty() {
                    on_chunk(StreamChunk::Text(response.message.content.clone()));
                }
                Ok(response)
            }
            Some(Outcome::Fail(err)) => Err(err),
            Some(Outcome::Stall) => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(AgentError::Canceled),
                    _ = tokio::time::sleep(Duration::from_secs(24 * 3600)) => Err(AgentError::Internal("stall elapsed".into())),
                }
            }
            None => Err(AgentError::Internal(format!(
                "script exhausted for model {}",
                request.model
            ))),
        }
    }

    fn default_model(&self) -> String {
        "scripted-model".into()
    }

    fn provider_name(&self) -> String {
        "scripted".into()
    }
}

pub fn http_error(status: u16, body: &str) -> AgentError {
    AgentError::HttpStatus {
        status,
        body: body.into(),
        retry_after_secs: None,
    }
}

pub fn executor(registry: ToolRegistry) -> Arc<ToolExecutor> {
    Arc::new(ToolExecutor::new(Arc::new(registry)))
}

pub fn agent_with(
    config: AgentConfig,
    memory: MemoryConfig,
    model: Arc<ScriptedModel>,
    registry: ToolRegistry,
) -> Agent {
    Agent::new(config, model, executor(registry), MemoryManager::new(memory))
}

/// Short-term memory as `(role, content)` pairs.
pub fn transcript(agent: &Agent) -> Vec<(String, String)> {
    agent.with_memory(|m| {
        m.short_term()
            .map(|item| {
                let msg = item.to_message();
                (format!("{:?}", msg.role).to_lowercase(), msg.content)
            })
            .collect()
    })
}
