//! Canonical LLM types.
//!
//! These are the provider-neutral shapes the rest of the crate works with.
//! Adapters translate them to and from each provider's wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{AgentError, Result};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a message participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    /// Text content; may be empty for assistant tool-call messages.
    #[serde(default)]
    pub content: String,

    /// Tool calls requested by the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Id of the call this tool message answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    /// Reasoning trace, for providers that expose one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,

    /// Provider signature over `reasoning`; required to replay it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_signature: Option<String>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            reasoning: None,
            reasoning_signature: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// An assistant message carrying tool calls.
    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(Role::Assistant, content)
        }
    }

    /// A tool result answering `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, content)
        }
    }

    pub fn with_reasoning(mut self, reasoning: Option<String>) -> Self {
        self.reasoning = reasoning.filter(|r| !r.is_empty());
        self
    }

    pub fn with_reasoning_signature(mut self, signature: Option<String>) -> Self {
        self.reasoning_signature = signature.filter(|s| !s.is_empty());
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a JSON object, in the order the model produced them.
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
        }
    }
}

/// Generate an id for a tool call the provider did not label.
pub fn synthetic_call_id() -> String {
    format!("call_{}", uuid::Uuid::now_v7().simple())
}

// ---------------------------------------------------------------------------
// Tool definitions (wire shape)
// ---------------------------------------------------------------------------

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema object describing the parameters.
    pub parameters: Value,
}

impl ToolDefinition {
    /// OpenAI function-tool shape.
    pub fn to_function_tool(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.parameters,
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Reasoning effort hint passed to models that support it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
    Xhigh,
}

impl ReasoningEffort {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Xhigh => "xhigh",
        }
    }

    /// Thinking-token budget for providers that take a budget instead.
    pub fn thinking_budget(self) -> u32 {
        match self {
            Self::Low => 2_048,
            Self::Medium => 8_192,
            Self::High => 16_384,
            Self::Xhigh => 32_768,
        }
    }
}

/// A provider-neutral chat request.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub stream: bool,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ChatRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            model: model.into(),
            messages,
            ..Self::default()
        }
    }

    /// Check sampling parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(AgentError::NoModelConfigured);
        }
        if let Some(t) = self.temperature
            && !(0.0..=2.0).contains(&t)
        {
            return Err(AgentError::ValidationError {
                field: "temperature".into(),
                reason: format!("{t} is outside [0, 2]"),
            });
        }
        if let Some(p) = self.top_p
            && !(0.0..=1.0).contains(&p)
        {
            return Err(AgentError::ValidationError {
                field: "top_p".into(),
                reason: format!("{p} is outside [0, 1]"),
            });
        }
        if self.max_tokens == Some(0) {
            return Err(AgentError::ValidationError {
                field: "max_tokens".into(),
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

/// Token counts reported for a single call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Last-seen rate-limit headroom.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub remaining_tokens: Option<u64>,
    pub remaining_requests: Option<u64>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.remaining_tokens.is_none() && self.remaining_requests.is_none()
    }
}

/// A complete assistant response.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatResponse {
    /// The assistant message (text, tool calls, reasoning).
    pub message: Message,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub rate_limit: RateLimitSnapshot,
}

impl ChatResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            message: Message::assistant(content),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".into()),
            rate_limit: RateLimitSnapshot::default(),
        }
    }

    pub fn tool_calls(calls: Vec<ToolCall>) -> Self {
        Self {
            message: Message::assistant_tool_calls("", calls),
            usage: TokenUsage::default(),
            finish_reason: Some("tool_calls".into()),
            rate_limit: RateLimitSnapshot::default(),
        }
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// Session-wide usage accumulator.
///
/// Counters only ever grow; the rate-limit fields hold the last values seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
    pub rate_limit: RateLimitSnapshot,
}

impl UsageTotals {
    /// Fold one successful response into the totals.
    pub fn record(&mut self, usage: &TokenUsage, rate_limit: &RateLimitSnapshot) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(usage.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(usage.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);
        self.requests = self.requests.saturating_add(1);
        if rate_limit.remaining_tokens.is_some() {
            self.rate_limit.remaining_tokens = rate_limit.remaining_tokens;
        }
        if rate_limit.remaining_requests.is_some() {
            self.rate_limit.remaining_requests = rate_limit.remaining_requests;
        }
    }
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Incremental output delivered while a response streams in.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    /// Visible content delta.
    Text(String),
    /// Reasoning delta.
    Reasoning(String),
    /// A tool call was announced.
    ToolCallStarted { id: String, name: String },
    /// Bytes arrived that carried no user-visible content.
    Activity,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_message_round_trips() {
        let msg = Message::tool_result("call_1", "ok");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tool_call_id\":\"call_1\""));
        assert!(!json.contains("tool_calls"));
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn function_tool_shape() {
        let def = ToolDefinition {
            name: "echo".into(),
            description: "Echo text".into(),
            parameters: json!({"type": "object"}),
        };
        let v = def.to_function_tool();
        assert_eq!(v["type"], "function");
        assert_eq!(v["function"]["name"], "echo");
        assert_eq!(v["function"]["parameters"]["type"], "object");
    }

    #[test]
    fn request_validation_ranges() {
        let mut req = ChatRequest::new("m", vec![Message::user("hi")]);
        assert!(req.validate().is_ok());
        req.temperature = Some(2.5);
        assert!(req.validate().is_err());
        req.temperature = Some(0.7);
        req.top_p = Some(1.2);
        assert!(req.validate().is_err());
        req.top_p = None;
        req.max_tokens = Some(0);
        assert!(req.validate().is_err());
        req.max_tokens = Some(1);
        assert!(req.validate().is_ok());
        req.model.clear();
        assert!(matches!(req.validate(), Err(AgentError::NoModelConfigured)));
    }

    #[test]
    fn usage_totals_never_decrease_and_keep_last_rate_limit() {
        let mut totals = UsageTotals::default();
        totals.record(
            &TokenUsage::new(10, 5),
            &RateLimitSnapshot {
                remaining_tokens: Some(900),
                remaining_requests: Some(9),
            },
        );
        totals.record(&TokenUsage::new(3, 2), &RateLimitSnapshot::default());
        assert_eq!(totals.prompt_tokens, 13);
        assert_eq!(totals.completion_tokens, 7);
        assert_eq!(totals.total_tokens, 20);
        assert_eq!(totals.requests, 2);
        assert_eq!(totals.rate_limit.remaining_tokens, Some(900));
    }

    #[test]
    fn empty_reasoning_is_dropped() {
        let m = Message::assistant("x").with_reasoning(Some(String::new()));
        assert!(m.reasoning.is_none());
    }

    #[test]
    fn reasoning_effort_serde() {
        let e: ReasoningEffort = serde_json::from_str("\"xhigh\"").unwrap();
        assert_eq!(e, ReasoningEffort::Xhigh);
        assert_eq!(e.as_str(), "xhigh");
    }
}
