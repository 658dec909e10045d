//! Memory compression via LLM summaries.
//!
//! When short-term memory passes its compression trigger, the oldest items
//! are rendered as a transcript and the model is asked for a summary. The
//! summary replaces those items in long-term memory.

use tokio_util::sync::CancellationToken;

use crate::agent::Agent;
use crate::context_cache::Invalidation;
use crate::error::{AgentError, Result};
use crate::llm::types::{ChatRequest, Message, Role};
use crate::memory::MemoryItem;
use crate::recovery::error_log;

/// Opening of the summarization request.
pub const COMPRESSION_PROMPT: &str = "Summarize the following conversation concisely, preserving key facts, \
decisions, file names, tool results and open questions needed to continue the work. Be factual and brief.";

const SUMMARY_MAX_TOKENS: u32 = 1024;

/// Render items as a plain transcript for the summarizer.
pub fn format_items_for_summary(items: &[MemoryItem]) -> String {
    let mut buf = String::with_capacity(items.len() * 200);
    for item in items {
        let message = item.to_message();
        let label = match message.role {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        };
        buf.push_str(label);
        buf.push_str(": ");
        buf.push_str(&message.content);
        for call in &message.tool_calls {
            buf.push_str(&format!("\n  [tool_call: {}({})]", call.name, call.arguments));
        }
        buf.push('\n');
    }
    buf
}

impl Agent {
    /// Summarize `items` with the current model.
    pub async fn summarize(&self, items: &[MemoryItem], cancel: &CancellationToken) -> Result<String> {
        let transcript = format_items_for_summary(items);
        let mut request = ChatRequest::new(
            self.model_id(),
            vec![Message::user(format!("{COMPRESSION_PROMPT}\n\n{transcript}"))],
        );
        request.temperature = Some(0.0);
        request.max_tokens = Some(SUMMARY_MAX_TOKENS);

        tracing::debug!(items = items.len(), model = %request.model, "requesting memory summary");
        let response = self.chat_model().complete(&request, cancel).await?;
        self.record_usage(&response);

        let summary = response.message.content.trim().to_owned();
        if summary.is_empty() {
            return Err(AgentError::LlmParseFailed {
                reason: "summary response was empty".into(),
            });
        }
        Ok(summary)
    }

    /// Compress short-term memory if its trigger has fired.
    ///
    /// Failures are logged and leave memory untouched; the next turn tries
    /// again. Returns whether a summary was committed.
    pub async fn compress_if_needed(&self, cancel: &CancellationToken) -> bool {
        let items = self.with_memory_mut(|m| m.get_items_to_compress());
        if items.is_empty() {
            return false;
        }
        self.compress(items, cancel).await
    }

    /// Summarize the compressible items even below the trigger. Used when
    /// the provider rejects a prompt as too long.
    pub(crate) async fn force_compress(&self, cancel: &CancellationToken) -> bool {
        let items: Vec<MemoryItem> = self.with_memory(|m| {
            let keep = crate::memory::KEEP_RECENT_ON_COMPRESS;
            let all: Vec<&MemoryItem> = m.short_term().collect();
            let cut = all.len().saturating_sub(keep);
            all[..cut].iter().filter(|i| !i.is_system()).map(|i| (*i).clone()).collect()
        });
        if items.is_empty() {
            return false;
        }
        self.compress(items, cancel).await
    }

    async fn compress(&self, items: Vec<MemoryItem>, cancel: &CancellationToken) -> bool {
        tracing::info!(agent = %self.name_str(), items = items.len(), "compressing short-term memory");
        match self.summarize(&items, cancel).await {
            Ok(summary) => {
                let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
                let committed = self.with_memory_mut(|m| m.compress_ids(&ids, &summary)).is_some();
                if committed {
                    self.invalidate_context(Invalidation::LongTermSummary);
                    if let Err(e) = self.persist_long_term().await {
                        tracing::warn!(error = %e, "failed to persist long-term memory");
                        error_log::global().record(&e, "memory compression", "memory.persist", true);
                    }
                }
                committed
            }
            Err(e) => {
                self.with_memory_mut(|m| m.abandon_compression());
                tracing::warn!(error = %e, "memory compression failed");
                error_log::global().record(&e, "memory compression", "memory.summarize", true);
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
