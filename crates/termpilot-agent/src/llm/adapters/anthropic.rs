//! Anthropic Messages API adapter.
//!
//! The system prompt is a top-level field, tool results travel as
//! `tool_result` blocks inside user messages, and the API requires strictly
//! alternating user/assistant turns. Consecutive same-role messages are
//! merged into one message with several content blocks.

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use super::{Credential, ProviderAdapter, insert_bearer, insert_named, json_u64, trim_base};
use crate::error::{AgentError, Result};
use crate::llm::provider::{ProviderFamily, is_oauth_token};
use crate::llm::streaming::{SseLine, StreamDecoder, ToolCallAccumulator, parse_data_json, parse_sse_line};
use crate::llm::types::{
    ChatRequest, ChatResponse, Message, RateLimitSnapshot, Role, StreamChunk, TokenUsage, ToolCall,
    synthetic_call_id,
};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Beta header required for OAuth bearer tokens.
const ANTHROPIC_OAUTH_BETA: &str = "oauth-2025-04-20";

/// `max_tokens` is mandatory on this API.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Inserted when the history would otherwise open with an assistant turn.
const LEADING_USER_PLACEHOLDER: &str = "Continue.";

#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicAdapter;

/// `<base>/v1`, without doubling a version segment already present.
fn versioned(base_url: &str) -> String {
    let base = trim_base(base_url);
    if base.ends_with("/v1") {
        base.to_owned()
    } else {
        format!("{base}/v1")
    }
}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Anthropic
    }

    fn endpoint_url(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{}/messages", versioned(base_url))
    }

    /// API keys go in `x-api-key`; OAuth tokens (including keys with the
    /// `sk-ant-oat` prefix) use bearer auth plus the oauth beta header.
    fn headers(&self, credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        match credential {
            Credential::None => {}
            Credential::ApiKey(key) if !is_oauth_token(key) => {
                insert_named(&mut headers, "x-api-key", key)?;
            }
            Credential::ApiKey(token) | Credential::OAuth { token, .. } => {
                insert_bearer(&mut headers, token)?;
                headers.insert(
                    "anthropic-beta",
                    HeaderValue::from_static(ANTHROPIC_OAUTH_BETA),
                );
            }
        }
        Ok(headers)
    }

    fn build_request(&self, request: &ChatRequest) -> Value {
        let (system, messages) = messages_to_anthropic(&request.messages);
        let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = json!({
            "model": request.model,
            "messages": messages,
        });

        if let Some(system) = system {
            body["system"] = json!(system);
        }

        match request.reasoning_effort {
            Some(effort) => {
                // Thinking requires max_tokens above the budget and rejects
                // custom sampling parameters.
                let budget = effort.thinking_budget();
                if max_tokens <= budget {
                    max_tokens = budget + DEFAULT_MAX_TOKENS;
                }
                body["thinking"] = json!({ "type": "enabled", "budget_tokens": budget });
            }
            None => {
                if let Some(temp) = request.temperature {
                    body["temperature"] = json!(temp.min(1.0));
                }
                if let Some(top_p) = request.top_p {
                    body["top_p"] = json!(top_p);
                }
            }
        }
        body["max_tokens"] = json!(max_tokens);

        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| {
                        json!({
                            "name": t.name,
                            "description": t.description,
                            "input_schema": t.parameters,
                        })
                    })
                    .collect(),
            );
        }

        if request.stream {
            body["stream"] = json!(true);
        }

        body
    }

    fn parse_response(&self, v: &Value) -> Result<ChatResponse> {
        if v["type"] == "error" {
            return Err(AgentError::LlmRequestFailed {
                reason: error_message(&v["error"]),
            });
        }
        let content = v["content"]
            .as_array()
            .ok_or_else(|| AgentError::LlmParseFailed {
                reason: "missing `content` array in response".into(),
            })?;

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut signature: Option<String> = None;
        let mut tool_calls = Vec::new();

        for block in content {
            match block["type"].as_str() {
                Some("text") => text.push_str(block["text"].as_str().unwrap_or_default()),
                Some("thinking") => {
                    reasoning.push_str(block["thinking"].as_str().unwrap_or_default());
                    if let Some(sig) = block["signature"].as_str() {
                        signature = Some(sig.to_owned());
                    }
                }
                Some("tool_use") => tool_calls.push(ToolCall::new(
                    block["id"]
                        .as_str()
                        .map(str::to_owned)
                        .unwrap_or_else(synthetic_call_id),
                    block["name"].as_str().unwrap_or_default(),
                    block["input"].clone(),
                )),
                _ => {}
            }
        }

        let usage = &v["usage"];
        let reasoning = (!reasoning.is_empty()).then_some(reasoning);
        Ok(ChatResponse {
            message: Message::assistant_tool_calls(text, tool_calls)
                .with_reasoning(reasoning)
                .with_reasoning_signature(signature),
            usage: TokenUsage::new(json_u64(usage, "input_tokens"), json_u64(usage, "output_tokens")),
            finish_reason: v["stop_reason"].as_str().map(str::to_owned),
            rate_limit: RateLimitSnapshot::default(),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(AnthropicStreamDecoder::default())
    }

    fn models_url(&self, base_url: &str) -> String {
        format!("{}/models", versioned(base_url))
    }
}

fn error_message(err: &Value) -> String {
    let kind = err["type"].as_str().unwrap_or("error");
    let msg = err["message"].as_str().unwrap_or_default();
    format!("{kind}: {msg}")
}

// ---------------------------------------------------------------------------
// Message conversion
// ---------------------------------------------------------------------------

/// Split out the system prompt and convert the rest to alternating turns.
pub fn messages_to_anthropic(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire: Vec<Value> = Vec::with_capacity(messages.len());

    for msg in messages {
        let (role, blocks) = match msg.role {
            Role::System => {
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&msg.content);
                    }
                    None => system = Some(msg.content.clone()),
                }
                continue;
            }
            Role::User => ("user", vec![json!({ "type": "text", "text": msg.content })]),
            Role::Assistant => {
                let mut blocks = Vec::new();
                // Signed thinking must lead the turn it belongs to; unsigned
                // thinking is rejected by the API and is left out.
                if let (Some(thinking), Some(signature)) = (&msg.reasoning, &msg.reasoning_signature) {
                    blocks.push(json!({
                        "type": "thinking",
                        "thinking": thinking,
                        "signature": signature,
                    }));
                }
                if !msg.content.is_empty() {
                    blocks.push(json!({ "type": "text", "text": msg.content }));
                }
                for tc in &msg.tool_calls {
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.name,
                        "input": tc.arguments,
                    }));
                }
                if blocks.is_empty() {
                    continue;
                }
                ("assistant", blocks)
            }
            Role::Tool => (
                "user",
                vec![json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": msg.content,
                })],
            ),
        };

        match wire.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(content) = last["content"].as_array_mut() {
                    content.extend(blocks);
                }
            }
            _ => {
                if wire.is_empty() && role == "assistant" {
                    wire.push(json!({
                        "role": "user",
                        "content": [{ "type": "text", "text": LEADING_USER_PLACEHOLDER }],
                    }));
                }
                wire.push(json!({ "role": role, "content": blocks }));
            }
        }
    }

    (system, wire)
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// Folds `message_start` .. `message_stop` events into a response.
#[derive(Debug, Default)]
pub struct AnthropicStreamDecoder {
    text: String,
    reasoning: String,
    signature: String,
    tools: ToolCallAccumulator,
    stop_reason: Option<String>,
    input_tokens: u64,
    output_tokens: u64,
    done: bool,
}

impl StreamDecoder for AnthropicStreamDecoder {
    fn feed_line(&mut self, line: &str, sink: &mut (dyn FnMut(StreamChunk) + Send)) -> Result<()> {
        let data = match parse_sse_line(line) {
            SseLine::Data(d) => d,
            SseLine::Done => {
                self.done = true;
                return Ok(());
            }
            SseLine::Event(_) | SseLine::Ignored => return Ok(()),
        };
        let Some(v) = parse_data_json("anthropic", data) else {
            return Ok(());
        };

        match v["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let usage = &v["message"]["usage"];
                self.input_tokens = json_u64(usage, "input_tokens");
                self.output_tokens = json_u64(usage, "output_tokens");
            }
            "content_block_start" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let block = &v["content_block"];
                if block["type"] == "tool_use" {
                    let name = block["name"].as_str();
                    if self.tools.start(index, block["id"].as_str(), name) {
                        sink(StreamChunk::ToolCallStarted {
                            id: self.tools.id_for(index).unwrap_or_default().to_owned(),
                            name: name.unwrap_or_default().to_owned(),
                        });
                    }
                }
            }
            "content_block_delta" => {
                let index = v["index"].as_u64().unwrap_or(0);
                let delta = &v["delta"];
                match delta["type"].as_str().unwrap_or_default() {
                    "text_delta" => {
                        let t = delta["text"].as_str().unwrap_or_default();
                        if !t.is_empty() {
                            self.text.push_str(t);
                            sink(StreamChunk::Text(t.to_owned()));
                        }
                    }
                    "thinking_delta" => {
                        let t = delta["thinking"].as_str().unwrap_or_default();
                        if !t.is_empty() {
                            self.reasoning.push_str(t);
                            sink(StreamChunk::Reasoning(t.to_owned()));
                        }
                    }
                    "input_json_delta" => {
                        self.tools
                            .append_arguments(index, delta["partial_json"].as_str().unwrap_or_default());
                    }
                    "signature_delta" => {
                        self.signature
                            .push_str(delta["signature"].as_str().unwrap_or_default());
                    }
                    other => tracing::debug!(delta_type = other, "ignoring unknown delta type"),
                }
            }
            "message_delta" => {
                if let Some(reason) = v["delta"]["stop_reason"].as_str() {
                    self.stop_reason = Some(reason.to_owned());
                }
                if let Some(out) = v["usage"]["output_tokens"].as_u64() {
                    self.output_tokens = out;
                }
            }
            "message_stop" => self.done = true,
            "error" => {
                return Err(AgentError::LlmStreamError {
                    reason: error_message(&v["error"]),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn finish(self: Box<Self>) -> Result<ChatResponse> {
        let this = *self;
        let calls = this.tools.finish()?;
        let reasoning = (!this.reasoning.is_empty()).then_some(this.reasoning);
        Ok(ChatResponse {
            message: Message::assistant_tool_calls(this.text, calls)
                .with_reasoning(reasoning)
                .with_reasoning_signature(Some(this.signature)),
            usage: TokenUsage::new(this.input_tokens, this.output_tokens),
            finish_reason: this.stop_reason,
            rate_limit: RateLimitSnapshot::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::{ReasoningEffort, ToolDefinition};

    #[test]
    fn system_is_split_and_roles_alternate() {
        let call = ToolCall::new("tu_1", "echo", json!({"text": "a"}));
        let call2 = ToolCall::new("tu_2", "echo", json!({"text": "b"}));
        let (system, wire) = messages_to_anthropic(&[
            Message::system("one"),
            Message::system("two"),
            Message::user("hi"),
            Message::user("again"),
            Message::assistant_tool_calls("", vec![call, call2]),
            Message::tool_result("tu_1", "a"),
            Message::tool_result("tu_2", "b"),
            Message::user("next"),
        ]);
        assert_eq!(system.as_deref(), Some("one\ntwo"));
        assert_eq!(wire.len(), 3);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"].as_array().unwrap().len(), 2);
        assert_eq!(wire[1]["content"][1]["id"], "tu_2");
        assert_eq!(wire[2]["content"][0]["type"], "tool_result");
        assert_eq!(wire[2]["content"][1]["tool_use_id"], "tu_2");
        assert_eq!(wire[2]["content"][2]["text"], "next");
    }

    #[test]
    fn leading_assistant_gets_placeholder() {
        let (_, wire) = messages_to_anthropic(&[Message::assistant("hello"), Message::user("x")]);
        assert_eq!(wire[0]["role"], "user");
        assert_eq!(wire[0]["content"][0]["text"], LEADING_USER_PLACEHOLDER);
        assert_eq!(wire[1]["role"], "assistant");
    }

    #[test]
    fn request_body_tools_and_defaults() {
        let mut req = ChatRequest::new("claude-3-5-sonnet", vec![Message::user("hi")]);
        req.tools.push(ToolDefinition {
            name: "echo".into(),
            description: "Echo".into(),
            parameters: json!({"type": "object"}),
        });
        req.temperature = Some(1.7);
        let body = AnthropicAdapter.build_request(&req);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["tools"][0]["input_schema"]["type"], "object");
        assert_eq!(body["temperature"], 1.0);
        assert!(body.get("stream").is_none());
    }

    #[test]
    fn thinking_budget_raises_max_tokens() {
        let mut req = ChatRequest::new("claude-sonnet-4", vec![Message::user("hi")]);
        req.reasoning_effort = Some(ReasoningEffort::Medium);
        req.max_tokens = Some(1000);
        req.temperature = Some(0.3);
        let body = AnthropicAdapter.build_request(&req);
        assert_eq!(body["thinking"]["budget_tokens"], 8192);
        assert!(body["max_tokens"].as_u64().unwrap() > 8192);
        assert!(body.get("temperature").is_none());
    }

    #[test]
    fn headers_by_credential_kind() {
        let api = AnthropicAdapter
            .headers(&Credential::ApiKey("sk-ant-api03-xyz".into()))
            .unwrap();
        assert_eq!(api["x-api-key"], "sk-ant-api03-xyz");
        assert!(api.get("authorization").is_none());
        assert_eq!(api["anthropic-version"], ANTHROPIC_VERSION);

        let oat = AnthropicAdapter
            .headers(&Credential::ApiKey("sk-ant-oat01-xyz".into()))
            .unwrap();
        assert_eq!(oat["authorization"], "Bearer sk-ant-oat01-xyz");
        assert_eq!(oat["anthropic-beta"], ANTHROPIC_OAUTH_BETA);

        let oauth = AnthropicAdapter
            .headers(&Credential::OAuth {
                token: "tok".into(),
                account_id: None,
            })
            .unwrap();
        assert_eq!(oauth["authorization"], "Bearer tok");
    }

    #[test]
    fn endpoint_does_not_double_version() {
        assert_eq!(
            AnthropicAdapter.endpoint_url("https://api.anthropic.com/", "m", false),
            "https://api.anthropic.com/v1/messages"
        );
        assert_eq!(
            AnthropicAdapter.endpoint_url("http://127.0.0.1:9/v1", "m", true),
            "http://127.0.0.1:9/v1/messages"
        );
    }

    #[test]
    fn parse_blocks() {
        let v = json!({
            "content": [
                {"type": "thinking", "thinking": "hmm", "signature": "sig-abc"},
                {"type": "text", "text": "Let me check."},
                {"type": "tool_use", "id": "tu_1", "name": "read_file", "input": {"path": "a.rs"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 20, "output_tokens": 4}
        });
        let resp = AnthropicAdapter.parse_response(&v).unwrap();
        assert_eq!(resp.message.content, "Let me check.");
        assert_eq!(resp.message.reasoning.as_deref(), Some("hmm"));
        assert_eq!(resp.message.reasoning_signature.as_deref(), Some("sig-abc"));
        assert_eq!(resp.message.tool_calls[0].arguments["path"], "a.rs");
        assert_eq!(resp.usage.total_tokens, 24);
    }

    #[test]
    fn stream_events_assemble() {
        let lines = [
            "event: message_start",
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":11,"output_tokens":1}}}"#,
            "event: content_block_start",
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_7","name":"echo","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"text\":"}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"x\"}"}}"#,
            "data: {broken",
            r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":9}}"#,
            r#"data: {"type":"message_stop"}"#,
        ];
        let mut d = AnthropicStreamDecoder::default();
        let mut chunks = Vec::new();
        for l in lines {
            d.feed_line(l, &mut |c| chunks.push(c)).unwrap();
        }
        assert!(d.is_done());
        assert_eq!(chunks[0], StreamChunk::Text("Hi".into()));
        assert!(matches!(&chunks[1], StreamChunk::ToolCallStarted { id, .. } if id == "tu_7"));
        let resp = Box::new(d).finish().unwrap();
        assert_eq!(resp.message.tool_calls[0].arguments, json!({"text": "x"}));
        assert_eq!(resp.usage, TokenUsage::new(11, 9));
        assert_eq!(resp.finish_reason.as_deref(), Some("tool_use"));
    }

    #[test]
    fn stream_thinking_keeps_its_signature() {
        let lines = [
            r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"thinking","thinking":""}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"thinking_delta","thinking":"check the file"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"EqQB"}}"#,
            r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"signature_delta","signature":"kYz9"}}"#,
            r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_3","name":"read_file","input":{}}}"#,
            r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"a.rs\"}"}}"#,
            r#"data: {"type":"message_stop"}"#,
        ];
        let mut d = AnthropicStreamDecoder::default();
        let mut chunks = Vec::new();
        for l in lines {
            d.feed_line(l, &mut |c| chunks.push(c)).unwrap();
        }
        assert_eq!(chunks[0], StreamChunk::Reasoning("check the file".into()));
        let resp = Box::new(d).finish().unwrap();
        assert_eq!(resp.message.reasoning.as_deref(), Some("check the file"));
        assert_eq!(resp.message.reasoning_signature.as_deref(), Some("EqQBkYz9"));

        // The stored turn replays with the signed thinking block first.
        let (_, wire) = messages_to_anthropic(&[Message::user("open a.rs"), resp.message]);
        let blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(blocks[0]["type"], "thinking");
        assert_eq!(blocks[0]["thinking"], "check the file");
        assert_eq!(blocks[0]["signature"], "EqQBkYz9");
        assert_eq!(blocks[1]["type"], "tool_use");
    }

    #[test]
    fn unsigned_thinking_is_not_replayed() {
        let msg = Message::assistant("done").with_reasoning(Some("private".into()));
        let (_, wire) = messages_to_anthropic(&[Message::user("go"), msg]);
        let blocks = wire[1]["content"].as_array().unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0]["type"], "text");
    }

    #[test]
    fn stream_error_event() {
        let mut d = AnthropicStreamDecoder::default();
        let err = d
            .feed_line(
                r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
                &mut |_| {},
            )
            .unwrap_err();
        assert!(err.to_string().contains("overloaded_error"));
    }
}
