//! The per-turn loop.
//!
//! A turn appends the user message, then alternates model calls and tool
//! executions until the model answers with plain text or the iteration
//! budget runs out. Model calls stream; a watchdog switches to the next
//! fallback model when no bytes arrive for `fallback_timeout`.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentConfig, TOOL_BUDGET_EXHAUSTED};
use crate::context_cache::Invalidation;
use crate::error::{AgentError, ErrorKind, Result};
use crate::llm::types::{ChatRequest, ChatResponse, Message, StreamChunk, ToolCall};
use crate::prompt;
use crate::recovery::error_log;
use crate::tools::ToolFilter;

/// Characters kept per message when a role turn overflows the context.
const SCRATCH_CLIP_CHARS: usize = 4000;

/// Where a turn reads and writes its history.
enum History {
    /// The agent's short-term memory. Counts messages added this turn.
    Memory { turn_messages: usize },
    /// A throwaway history under a fixed system prompt.
    Scratch { system: String, messages: Vec<Message> },
}

struct Prepared {
    messages: Vec<Message>,
    fingerprint: Option<u64>,
    full_prefix: bool,
}

/// Errors after which the next fallback model is worth trying. Auth counts,
/// since a key may be entitled to the fallback but not the primary. Content
/// policy does not, and context length is handled by trimming the history.
fn warrants_fallback(err: &AgentError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Auth | ErrorKind::Transport | ErrorKind::RateLimit | ErrorKind::Unknown
    )
}

impl Agent {
    /// Run one conversational turn and return the assistant's text.
    ///
    /// Empty input is rejected before memory is touched. A canceled turn
    /// returns [`AgentError::Canceled`] and persists no partial assistant
    /// text.
    pub async fn chat(&self, text: &str, cancel: &CancellationToken) -> Result<String> {
        if text.trim().is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }

        let _turn = self.turn_lock.lock().await;
        self.touch();
        let decay = self.config().working_decay_per_hour;
        let (turn_id, aged) = self.with_memory_mut(|m| {
            let id = m.add_message(Message::user(text));
            (id, if decay > 0.0 { m.age_working(decay) } else { 0 })
        });
        self.mark_turn_start(turn_id);
        if aged > 0 {
            self.invalidate_context(Invalidation::WorkingMemory);
        }

        tracing::debug!(agent = %self.name_str(), chars = text.len(), "turn started");
        let mut history = History::Memory { turn_messages: 1 };
        let answer = self.run_loop(&mut history, ToolFilter::All, cancel).await?;

        self.compress_if_needed(cancel).await;
        Ok(answer)
    }

    /// Run one turn under `system_prompt` without touching memory.
    pub async fn run_role(
        &self,
        system_prompt: &str,
        input: &str,
        tools: ToolFilter,
        cancel: &CancellationToken,
    ) -> Result<String> {
        if input.trim().is_empty() {
            return Err(AgentError::EmptyMessage);
        }
        if cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }
        let _turn = self.turn_lock.lock().await;
        self.touch();
        let mut history = History::Scratch {
            system: system_prompt.to_owned(),
            messages: vec![Message::user(input)],
        };
        self.run_loop(&mut history, tools, cancel).await
    }

    /// Append an exchange produced outside [`Agent::chat`], e.g. by the
    /// pipeline, so later turns can refer to it.
    pub fn record_exchange(&self, user: &str, assistant: &str) {
        self.with_memory_mut(|m| {
            m.add_message(Message::user(user));
            m.add_message(Message::assistant(assistant));
        });
    }

    async fn run_loop(&self, history: &mut History, filter: ToolFilter, cancel: &CancellationToken) -> Result<String> {
        let config = self.config();
        let definitions = self.tools().definitions(filter);
        let mut context_retry_used = false;
        let mut iteration = 0usize;

        while iteration < config.max_tool_iterations {
            if cancel.is_cancelled() {
                return Err(AgentError::Canceled);
            }

            let prepared = self.prepare(history, &config);
            let message_count = prepared.messages.len();
            let request = ChatRequest {
                model: self.model_id(),
                messages: prepared.messages,
                tools: definitions.clone(),
                temperature: config.temperature,
                top_p: config.top_p,
                max_tokens: config.max_tokens,
                stream: true,
                reasoning_effort: config.reasoning_effort,
            };

            let response = match self.stream_with_fallback(&request, &config, cancel).await {
                Ok(response) => response,
                Err(e) if e.kind() == ErrorKind::ContextLength && !context_retry_used => {
                    tracing::warn!(agent = %self.name_str(), error = %e, "context too long, shrinking and retrying");
                    context_retry_used = true;
                    self.shrink(history, cancel).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            iteration += 1;

            self.record_usage(&response);
            if let Some(fp) = prepared.fingerprint {
                self.cache
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .record_success(prepared.full_prefix, fp, message_count);
            }

            let ChatResponse { message, .. } = response;
            if message.has_tool_calls() {
                tracing::info!(
                    agent = %self.name_str(),
                    iteration,
                    tool_count = message.tool_calls.len(),
                    tools = ?message.tool_calls.iter().map(|c| &c.name).collect::<Vec<_>>(),
                    "model requested tool calls"
                );
                let calls = message.tool_calls.clone();
                self.append(
                    history,
                    Message::assistant_tool_calls(message.content, calls.clone())
                        .with_reasoning(message.reasoning)
                        .with_reasoning_signature(message.reasoning_signature),
                );
                self.run_tools(history, &calls, filter, cancel).await?;
                continue;
            }

            let content = message.content;
            self.append(
                history,
                Message::assistant(content.clone())
                    .with_reasoning(message.reasoning)
                    .with_reasoning_signature(message.reasoning_signature),
            );
            self.touch();
            tracing::debug!(agent = %self.name_str(), iterations = iteration, "turn completed");
            return Ok(content);
        }

        tracing::warn!(
            agent = %self.name_str(),
            max = config.max_tool_iterations,
            "tool iteration budget exhausted"
        );
        self.append(history, Message::assistant(TOOL_BUDGET_EXHAUSTED));
        Ok(TOOL_BUDGET_EXHAUSTED.to_owned())
    }

    fn prepare(&self, history: &History, config: &AgentConfig) -> Prepared {
        match history {
            History::Memory { turn_messages } => {
                let system = self.with_memory(|m| prompt::build_system_prompt(&config.profile, m));
                let fp = prompt::fingerprint(&system);
                let elide = self.chat_model().supports_prefix_caching()
                    && self.cache.lock().unwrap_or_else(PoisonError::into_inner).can_elide(fp);
                let window = config.history_window.max(*turn_messages);
                let messages = self.with_memory(|m| prompt::assemble(&system, m, window, elide));
                Prepared {
                    messages,
                    fingerprint: Some(fp),
                    full_prefix: !elide,
                }
            }
            History::Scratch { system, messages } => {
                let mut all = Vec::with_capacity(messages.len() + 1);
                all.push(Message::system(system.clone()));
                all.extend(messages.iter().cloned());
                Prepared {
                    messages: all,
                    fingerprint: None,
                    full_prefix: true,
                }
            }
        }
    }

    fn append(&self, history: &mut History, message: Message) {
        match history {
            History::Memory { turn_messages } => {
                *turn_messages += 1;
                self.with_memory_mut(|m| m.add_message(message));
            }
            History::Scratch { messages, .. } => messages.push(message),
        }
    }

    /// Make room after a context-length rejection.
    async fn shrink(&self, history: &mut History, cancel: &CancellationToken) {
        match history {
            History::Memory { .. } => {
                if !self.force_compress(cancel).await {
                    let removed = self.with_memory_mut(|m| m.trim_oldest(0.5));
                    tracing::info!(removed, "trimmed short-term memory after context overflow");
                }
                self.invalidate_context(Invalidation::LongTermSummary);
            }
            History::Scratch { messages, .. } => {
                for m in messages.iter_mut() {
                    m.content = keep_tail(&m.content, SCRATCH_CLIP_CHARS);
                }
            }
        }
    }

    async fn run_tools(
        &self,
        history: &mut History,
        calls: &[ToolCall],
        filter: ToolFilter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let observer = self.observer();
        for (idx, call) in calls.iter().enumerate() {
            if cancel.is_cancelled() {
                // Every call still gets its result message.
                for rest in &calls[idx..] {
                    self.append(
                        history,
                        Message::tool_result(&rest.id, format!("Error: {}", AgentError::Canceled)),
                    );
                }
                return Err(AgentError::Canceled);
            }

            observer.on_tool_start(call);
            let result = self.tools().execute_filtered(call, filter, cancel).await;

            match (&result.error, result.success) {
                (Some(err), false) => observer.on_tool_error(call, err),
                _ => observer.on_tool_complete(call, &result),
            }
            self.append(history, Message::tool_result(&call.id, result.to_message_content()));
            self.touch();
        }
        Ok(())
    }

    /// Stream `request`, moving down the fallback list on failures that a
    /// different model might not hit.
    async fn stream_with_fallback(
        &self,
        request: &ChatRequest,
        config: &AgentConfig,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let mut candidates = vec![request.model.clone()];
        for model in &config.fallback_models {
            if !model.trim().is_empty() && !candidates.contains(model) {
                candidates.push(model.clone());
            }
        }

        let mut last_error = None;
        for (i, model) in candidates.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(AgentError::Canceled);
            }
            if i > 0 {
                self.push_note(format!("switched to fallback: {model}"));
            }
            let mut attempt = request.clone();
            attempt.model = model.clone();

            match self.stream_watched(&attempt, config.fallback_timeout, cancel).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_canceled() || !warrants_fallback(&e) => return Err(e),
                Err(e) => {
                    let has_next = i + 1 < candidates.len();
                    tracing::warn!(
                        agent = %self.name_str(),
                        model = %model,
                        error = %e,
                        has_fallback = has_next,
                        "model call failed"
                    );
                    error_log::global().record(&e, &format!("model {model}"), "agent.chat", has_next);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or(AgentError::NoModelConfigured))
    }

    /// One streaming call guarded by the stall watchdog.
    async fn stream_watched(
        &self,
        request: &ChatRequest,
        stall_after: Duration,
        cancel: &CancellationToken,
    ) -> Result<ChatResponse> {
        let observer = self.observer();
        let last_bytes = Mutex::new(Instant::now());
        let stamp = || *last_bytes.lock().unwrap_or_else(PoisonError::into_inner);

        let mut sink = |chunk: StreamChunk| {
            *last_bytes.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
            self.touch();
            if chunk != StreamChunk::Activity {
                observer.on_chunk(&chunk);
            }
        };
        let call = self.chat_model().stream(request, &mut sink, cancel);

        if stall_after.is_zero() {
            return call.await;
        }

        let watchdog = async {
            loop {
                tokio::time::sleep_until(stamp() + stall_after).await;
                if stamp().elapsed() >= stall_after {
                    break;
                }
            }
        };

        tokio::select! {
            result = call => result,
            () = watchdog => {
                tracing::warn!(
                    agent = %self.name_str(),
                    model = %request.model,
                    secs = stall_after.as_secs(),
                    "stream stalled"
                );
                Err(AgentError::StreamStalled { secs: stall_after.as_secs() })
            }
        }
    }
}

fn keep_tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_owned();
    }
    let tail: String = text.chars().skip(count - max_chars).collect();
    format!("[earlier content truncated]\n{tail}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
