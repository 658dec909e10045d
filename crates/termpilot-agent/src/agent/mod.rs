//! The conversation engine.
//!
//! An [`Agent`] owns one conversation: its memory, context cache, usage
//! totals and activity clock. It borrows a [`ChatModel`] and a
//! [`ToolDispatch`] through trait objects, so tests and background
//! orchestrators can swap either side.
//!
//! - [`turn`] -- the per-turn loop: prompt assembly, streaming, tool calls,
//!   fallback models and the stall watchdog.
//! - [`compress`] -- LLM summaries for memory compression.

pub mod compress;
pub mod turn;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context_cache::{ContextCache, Invalidation};
use crate::error::Result;
use crate::llm::client::{ChatModel, LlmClientConfig};
use crate::llm::types::{ReasoningEffort, StreamChunk, ToolCall, UsageTotals};
use crate::memory::MemoryManager;
use crate::prompt::PromptProfile;
use crate::tools::{ToolDispatch, ToolFilter, ToolResult};

/// Tool-loop iterations allowed per turn.
pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 25;

/// Seconds without stream bytes before switching to a fallback model.
pub const DEFAULT_FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Text returned when a turn runs out of tool iterations.
pub const TOOL_BUDGET_EXHAUSTED: &str = "tool budget exhausted";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub model: String,
    pub fallback_models: Vec<String>,
    /// Zero disables the stall watchdog.
    #[serde(with = "secs")]
    pub fallback_timeout: Duration,
    pub max_tool_iterations: usize,
    /// Short-term messages sent with each request.
    pub history_window: usize,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Working-memory relevance lost per idle hour, checked at each turn.
    pub working_decay_per_hour: f64,
    pub profile: PromptProfile,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            fallback_models: Vec::new(),
            fallback_timeout: DEFAULT_FALLBACK_TIMEOUT,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            history_window: 40,
            temperature: None,
            top_p: None,
            max_tokens: None,
            reasoning_effort: None,
            working_decay_per_hour: 0.05,
            profile: PromptProfile::default(),
        }
    }
}

impl AgentConfig {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            ..Self::default()
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

// ---------------------------------------------------------------------------
// Observer and role seams
// ---------------------------------------------------------------------------

/// UI hooks fired during a turn. Every method defaults to a no-op.
pub trait AgentObserver: Send + Sync {
    fn on_status(&self, _status: &str) {}
    fn on_chunk(&self, _chunk: &StreamChunk) {}
    fn on_tool_start(&self, _call: &ToolCall) {}
    fn on_tool_complete(&self, _call: &ToolCall, _result: &ToolResult) {}
    fn on_tool_error(&self, _call: &ToolCall, _error: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl AgentObserver for NoopObserver {}

/// What the pipeline and dual-session orchestrators need from an agent.
#[async_trait]
pub trait TurnAgent: Send + Sync {
    /// Label for logs and transcripts.
    fn name(&self) -> String;

    /// One conversational turn against the agent's own memory.
    async fn chat(&self, text: &str, cancel: &CancellationToken) -> Result<String>;

    /// One turn under a role system prompt with a throwaway history.
    async fn run_role(
        &self,
        system_prompt: &str,
        input: &str,
        tools: ToolFilter,
        cancel: &CancellationToken,
    ) -> Result<String>;

    /// Last time the agent saw stream bytes or finished a tool.
    fn last_activity(&self) -> Instant;

    /// Forget the latest `chat` turn before it is retried.
    fn discard_last_turn(&self) {}
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    name: String,
    config: RwLock<AgentConfig>,
    model: Arc<dyn ChatModel>,
    tools: Arc<dyn ToolDispatch>,
    memory: RwLock<MemoryManager>,
    cache: Mutex<ContextCache>,
    usage: Mutex<UsageTotals>,
    last_activity: Mutex<Instant>,
    observer: RwLock<Arc<dyn AgentObserver>>,
    pipeline_enabled: AtomicBool,
    notes: Mutex<Vec<String>>,
    /// Id of the user message that opened the latest `chat` turn.
    turn_start: Mutex<Option<String>>,
    /// One turn at a time per agent.
    turn_lock: tokio::sync::Mutex<()>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        model: Arc<dyn ChatModel>,
        tools: Arc<dyn ToolDispatch>,
        memory: MemoryManager,
    ) -> Self {
        Self {
            name: "agent".to_owned(),
            config: RwLock::new(config),
            model,
            tools,
            memory: RwLock::new(memory),
            cache: Mutex::new(ContextCache::new()),
            usage: Mutex::new(UsageTotals::default()),
            last_activity: Mutex::new(Instant::now()),
            observer: RwLock::new(Arc::new(NoopObserver)),
            pipeline_enabled: AtomicBool::new(false),
            notes: Mutex::new(Vec::new()),
            turn_start: Mutex::new(None),
            turn_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_observer(self, observer: Arc<dyn AgentObserver>) -> Self {
        self.set_observer(observer);
        self
    }

    pub fn set_observer(&self, observer: Arc<dyn AgentObserver>) {
        *self.observer.write().unwrap_or_else(PoisonError::into_inner) = observer;
    }

    pub(crate) fn observer(&self) -> Arc<dyn AgentObserver> {
        Arc::clone(&self.observer.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn name_str(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> AgentConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn model_id(&self) -> String {
        let model = self.config.read().unwrap_or_else(PoisonError::into_inner).model.clone();
        if model.is_empty() { self.model.default_model() } else { model }
    }

    pub fn chat_model(&self) -> &Arc<dyn ChatModel> {
        &self.model
    }

    pub fn tools(&self) -> &Arc<dyn ToolDispatch> {
        &self.tools
    }

    /// Switch the primary model; the cached prefix no longer applies.
    pub fn set_model(&self, model: impl Into<String>) {
        let model = model.into();
        tracing::info!(model = %model, "model changed");
        self.config.write().unwrap_or_else(PoisonError::into_inner).model = model;
        self.invalidate_context(Invalidation::Model);
    }

    /// Point the model at another provider endpoint and adopt its model.
    /// The cached prefix is invalidated for each of provider, base URL and
    /// model that actually changed.
    pub fn switch_provider(&self, config: &LlmClientConfig) -> Result<()> {
        let provider_before = self.model.provider_name();
        let url_before = self.model.endpoint_url();
        self.model.switch_provider(config)?;

        if self.model.provider_name() != provider_before {
            self.invalidate_context(Invalidation::Provider);
        }
        if self.model.endpoint_url() != url_before {
            self.invalidate_context(Invalidation::BaseUrl);
        }
        if !config.model.trim().is_empty() && config.model != self.model_id() {
            self.set_model(config.model.clone());
        }
        tracing::info!(agent = %self.name, provider = %self.model.provider_name(), "provider switched");
        Ok(())
    }

    /// Replace the prompt profile (identity, rules, tasks).
    pub fn set_profile(&self, profile: PromptProfile) {
        self.config.write().unwrap_or_else(PoisonError::into_inner).profile = profile;
        self.invalidate_context(Invalidation::SystemPrompt);
    }

    pub fn invalidate_context(&self, reason: Invalidation) {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).invalidate(reason);
    }

    pub fn context_cache(&self) -> ContextCache {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn usage(&self) -> UsageTotals {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Run `f` with shared access to memory.
    pub fn with_memory<T>(&self, f: impl FnOnce(&MemoryManager) -> T) -> T {
        f(&self.memory.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn with_memory_mut<T>(&self, f: impl FnOnce(&mut MemoryManager) -> T) -> T {
        f(&mut self.memory.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Put a file into working memory.
    pub fn add_file_to_context(&self, path: &str, content: impl Into<String>, relevance: f64) {
        self.with_memory_mut(|m| m.add_file(path, content, relevance));
        self.invalidate_context(Invalidation::WorkingMemory);
    }

    /// Record a decision in long-term memory and persist it.
    pub async fn remember_decision(&self, decision: &str) -> Result<()> {
        self.with_memory_mut(|m| m.add_decision(decision));
        self.invalidate_context(Invalidation::LongTermSummary);
        self.persist_long_term().await
    }

    /// Clear the conversation and working set.
    pub fn reset(&self) {
        self.with_memory_mut(MemoryManager::reset);
        self.invalidate_context(Invalidation::Reset);
        self.notes.lock().unwrap_or_else(PoisonError::into_inner).clear();
        tracing::info!(agent = %self.name, "conversation reset");
    }

    pub(crate) fn mark_turn_start(&self, id: String) {
        *self.turn_start.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
    }

    /// Drop the latest `chat` turn from short-term memory: its user
    /// message and everything recorded after it. Returns the number of
    /// items removed.
    pub fn discard_last_turn(&self) -> usize {
        let Some(id) = self.turn_start.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return 0;
        };
        let removed = self.with_memory_mut(|m| m.truncate_short_from(&id));
        if removed > 0 {
            tracing::debug!(agent = %self.name, removed, "discarded last turn");
        }
        removed
    }

    pub fn pipeline_enabled(&self) -> bool {
        self.pipeline_enabled.load(Ordering::Relaxed)
    }

    pub fn set_pipeline_enabled(&self, enabled: bool) {
        self.pipeline_enabled.store(enabled, Ordering::Relaxed);
    }

    /// System notes emitted during turns, e.g. fallback switches.
    pub fn system_notes(&self) -> Vec<String> {
        self.notes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn push_note(&self, note: String) {
        tracing::info!(agent = %self.name, note = %note, "system note");
        self.observer().on_status(&note);
        self.notes.lock().unwrap_or_else(PoisonError::into_inner).push(note);
    }

    pub fn last_activity_at(&self) -> Instant {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub(crate) fn record_usage(&self, response: &crate::llm::types::ChatResponse) {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&response.usage, &response.rate_limit);
    }

    /// Write the long-term tier to its configured path, if any.
    pub async fn persist_long_term(&self) -> Result<()> {
        let (path, items) = self.with_memory(|m| (m.config().storage_path.clone(), m.long_term_snapshot()));
        match path {
            Some(path) => crate::memory::persist::save_long_term(&path, &items).await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("model", &self.model_id())
            .field("provider", &self.model.provider_name())
            .finish()
    }
}

#[async_trait]
impl TurnAgent for Agent {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn chat(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        Agent::chat(self, text, cancel).await
    }

    async fn run_role(
        &self,
        system_prompt: &str,
        input: &str,
        tools: ToolFilter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        Agent::run_role(self, system_prompt, input, tools, cancel).await
    }

    fn last_activity(&self) -> Instant {
        self.last_activity_at()
    }

    fn discard_last_turn(&self) {
        Agent::discard_last_turn(self);
    }
}
