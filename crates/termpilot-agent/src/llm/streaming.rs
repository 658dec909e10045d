//! Server-Sent Events plumbing shared by every adapter.
//!
//! Bytes from the HTTP body are split into lines by [`SseLineBuffer`]; each
//! line is classified by [`parse_sse_line`] and handed to the adapter's
//! [`StreamDecoder`], which assembles text, reasoning and tool calls.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{ChatResponse, StreamChunk, ToolCall, synthetic_call_id};

// ---------------------------------------------------------------------------
// Line buffer
// ---------------------------------------------------------------------------

/// Splits a byte stream into complete lines.
///
/// Bytes are buffered rather than decoded per chunk, so a multi-byte UTF-8
/// character split across two network reads is reassembled intact.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    pending: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            lines.push(line.trim_end_matches('\r').to_owned());
        }
        lines
    }

    /// Whatever is left once the body ends without a trailing newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.pending).trim_end().to_owned();
        self.pending.clear();
        (!rest.is_empty()).then_some(rest)
    }
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// One classified SSE line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine<'a> {
    /// `event: <name>`
    Event(&'a str),
    /// `data: <payload>`
    Data(&'a str),
    /// The `data: [DONE]` terminator.
    Done,
    /// Blank lines, comments and other fields.
    Ignored,
}

pub fn parse_sse_line(line: &str) -> SseLine<'_> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with(':') {
        return SseLine::Ignored;
    }
    if let Some(name) = line.strip_prefix("event:") {
        return SseLine::Event(name.trim());
    }
    if let Some(data) = line.strip_prefix("data:") {
        let data = data.trim_start();
        if data.trim() == "[DONE]" {
            return SseLine::Done;
        }
        return SseLine::Data(data);
    }
    SseLine::Ignored
}

/// Parse a `data:` payload, logging and skipping malformed JSON.
pub fn parse_data_json(provider: &str, data: &str) -> Option<Value> {
    match serde_json::from_str(data) {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!(provider, error = %e, "skipping malformed SSE data line");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Decoder seam
// ---------------------------------------------------------------------------

/// Per-provider stream state machine.
pub trait StreamDecoder: Send {
    /// Feed one line; deltas are forwarded to `sink` as they are decoded.
    fn feed_line(&mut self, line: &str, sink: &mut (dyn FnMut(StreamChunk) + Send)) -> Result<()>;

    /// True once the provider's terminator has been seen.
    fn is_done(&self) -> bool;

    /// Whether the provider sends an explicit terminator. A body that ends
    /// before it is a truncated reply.
    fn has_terminator(&self) -> bool {
        true
    }

    /// Assemble the final response.
    fn finish(self: Box<Self>) -> Result<ChatResponse>;
}

// ---------------------------------------------------------------------------
// Tool-call accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
    /// Arguments delivered whole rather than as a string fragment.
    complete_args: Option<Value>,
}

/// Assembles streamed tool calls keyed by their stream index.
///
/// The id and name usually arrive on the first delta for an index; argument
/// text arrives as JSON string fragments that are only parsed at the end.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u64, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Register or update the id/name for `index`.
    ///
    /// Returns true the first time a name is seen for the index.
    pub fn start(&mut self, index: u64, id: Option<&str>, name: Option<&str>) -> bool {
        let entry = self.calls.entry(index).or_default();
        if let Some(id) = id.filter(|s| !s.is_empty()) {
            entry.id = id.to_owned();
        }
        let mut announced = false;
        if let Some(name) = name.filter(|s| !s.is_empty()) {
            announced = entry.name.is_empty();
            entry.name.push_str(name);
        }
        announced
    }

    /// Append an argument fragment.
    pub fn append_arguments(&mut self, index: u64, fragment: &str) {
        self.calls
            .entry(index)
            .or_default()
            .arguments
            .push_str(fragment);
    }

    /// Record arguments that arrived as a complete JSON value.
    pub fn set_arguments(&mut self, index: u64, args: Value) {
        self.calls.entry(index).or_default().complete_args = Some(args);
    }

    pub fn id_for(&self, index: u64) -> Option<&str> {
        self.calls.get(&index).map(|c| c.id.as_str())
    }

    /// Parse every accumulated call.
    ///
    /// Argument text that is not valid JSON means the stream was cut off
    /// mid-payload, which fails the whole response.
    pub fn finish(self) -> Result<Vec<ToolCall>> {
        self.calls
            .into_values()
            .map(|c| {
                let arguments = match c.complete_args {
                    Some(v) => v,
                    None if c.arguments.trim().is_empty() => Value::Object(Default::default()),
                    None => serde_json::from_str(&c.arguments).map_err(|e| {
                        AgentError::LlmStreamError {
                            reason: format!("truncated arguments for tool call `{}`: {e}", c.name),
                        }
                    })?,
                };
                let id = if c.id.is_empty() {
                    synthetic_call_id()
                } else {
                    c.id
                };
                Ok(ToolCall::new(id, c.name, arguments))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
