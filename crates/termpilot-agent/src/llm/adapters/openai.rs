//! OpenAI Chat Completions adapter.
//!
//! Also serves every OpenAI-compatible endpoint in the catalog (DeepSeek,
//! Groq, OpenRouter, NVIDIA, Ollama). System messages stay inline, tool
//! calls live in `assistant.tool_calls` and tool results use `role: "tool"`.

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use super::{Credential, ProviderAdapter, insert_bearer, insert_named, json_u64, parse_arguments, trim_base};
use crate::error::{AgentError, Result};
use crate::llm::provider::ProviderFamily;
use crate::llm::streaming::{SseLine, StreamDecoder, ToolCallAccumulator, parse_data_json, parse_sse_line};
use crate::llm::types::{
    ChatRequest, ChatResponse, Message, RateLimitSnapshot, Role, StreamChunk, TokenUsage, ToolCall,
    synthetic_call_id,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiAdapter;

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::OpenAi
    }

    fn endpoint_url(&self, base_url: &str, _model: &str, _stream: bool) -> String {
        format!("{}/chat/completions", trim_base(base_url))
    }

    fn headers(&self, credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match credential {
            Credential::None => {}
            Credential::ApiKey(key) => insert_bearer(&mut headers, key)?,
            Credential::OAuth { token, account_id } => {
                insert_bearer(&mut headers, token)?;
                if let Some(account) = account_id {
                    insert_named(&mut headers, "chatgpt-account-id", account)?;
                }
            }
        }
        Ok(headers)
    }

    fn build_request(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "messages": messages_to_openai(&request.messages),
        });

        if let Some(max) = request.max_tokens {
            body["max_tokens"] = json!(max);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = request.top_p {
            body["top_p"] = json!(top_p);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|t| t.to_function_tool())
                    .collect(),
            );
        }
        if let Some(effort) = request.reasoning_effort {
            body["reasoning_effort"] = json!(effort.as_str());
        }
        if request.stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({ "include_usage": true });
        }

        body
    }

    fn parse_response(&self, v: &Value) -> Result<ChatResponse> {
        let choice = &v["choices"][0];
        let message = &choice["message"];
        if message.is_null() {
            return Err(AgentError::LlmParseFailed {
                reason: "missing `choices[0].message` in response".into(),
            });
        }

        let tool_calls: Vec<ToolCall> = message["tool_calls"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|tc| {
                        let func = &tc["function"];
                        ToolCall::new(
                            tc["id"]
                                .as_str()
                                .map(str::to_owned)
                                .unwrap_or_else(synthetic_call_id),
                            func["name"].as_str().unwrap_or_default(),
                            parse_arguments(func["arguments"].as_str().unwrap_or("{}")),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let content = message["content"].as_str().unwrap_or_default();
        let reasoning = message["reasoning_content"]
            .as_str()
            .or_else(|| message["reasoning"].as_str())
            .map(str::to_owned);

        Ok(ChatResponse {
            message: Message::assistant_tool_calls(content, tool_calls).with_reasoning(reasoning),
            usage: parse_usage(&v["usage"]),
            finish_reason: choice["finish_reason"].as_str().map(str::to_owned),
            rate_limit: RateLimitSnapshot::default(),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(OpenAiStreamDecoder::default())
    }
}

// ---------------------------------------------------------------------------
// Message conversion
// ---------------------------------------------------------------------------

/// Convert canonical messages to the Chat Completions wire format.
pub fn messages_to_openai(messages: &[Message]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::System | Role::User => json!({
                "role": msg.role.as_str(),
                "content": msg.content,
            }),
            Role::Assistant if msg.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": msg.content,
            }),
            Role::Assistant => {
                let calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect();
                let mut m = json!({
                    "role": "assistant",
                    "content": Value::Null,
                    "tool_calls": calls,
                });
                if !msg.content.is_empty() {
                    m["content"] = json!(msg.content);
                }
                m
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content,
            }),
        })
        .collect()
}

fn parse_usage(u: &Value) -> TokenUsage {
    if u.is_null() {
        return TokenUsage::default();
    }
    let prompt = json_u64(u, "prompt_tokens");
    let completion = json_u64(u, "completion_tokens");
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: u["total_tokens"].as_u64().unwrap_or(prompt + completion),
    }
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// Accumulates `choices[0].delta` fragments until `data: [DONE]`.
#[derive(Debug, Default)]
pub struct OpenAiStreamDecoder {
    text: String,
    reasoning: String,
    tools: ToolCallAccumulator,
    finish_reason: Option<String>,
    usage: TokenUsage,
    done: bool,
}

impl StreamDecoder for OpenAiStreamDecoder {
    fn feed_line(&mut self, line: &str, sink: &mut (dyn FnMut(StreamChunk) + Send)) -> Result<()> {
        let data = match parse_sse_line(line) {
            SseLine::Done => {
                self.done = true;
                return Ok(());
            }
            SseLine::Data(d) => d,
            SseLine::Event(_) | SseLine::Ignored => return Ok(()),
        };
        let Some(v) = parse_data_json("openai", data) else {
            return Ok(());
        };

        if let Some(err) = v.get("error").filter(|e| !e.is_null()) {
            return Err(AgentError::LlmStreamError {
                reason: err["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| err.to_string()),
            });
        }

        if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
            self.usage = parse_usage(u);
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            return Ok(());
        }

        if let Some(content) = delta["content"].as_str().filter(|s| !s.is_empty()) {
            self.text.push_str(content);
            sink(StreamChunk::Text(content.to_owned()));
        }

        let reasoning = delta["reasoning_content"]
            .as_str()
            .or_else(|| delta["reasoning"].as_str());
        if let Some(r) = reasoning.filter(|s| !s.is_empty()) {
            self.reasoning.push_str(r);
            sink(StreamChunk::Reasoning(r.to_owned()));
        }

        if let Some(calls) = delta["tool_calls"].as_array() {
            for tc in calls {
                let index = tc["index"].as_u64().unwrap_or(0);
                let func = &tc["function"];
                let name = func["name"].as_str();
                if self.tools.start(index, tc["id"].as_str(), name) {
                    sink(StreamChunk::ToolCallStarted {
                        id: self.tools.id_for(index).unwrap_or_default().to_owned(),
                        name: name.unwrap_or_default().to_owned(),
                    });
                }
                if let Some(args) = func["arguments"].as_str() {
                    self.tools.append_arguments(index, args);
                }
            }
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
            message: Message::assistant_tool_calls(this.text, calls).with_reasoning(reasoning),
            usage: this.usage,
            finish_reason: this.finish_reason,
            rate_limit: RateLimitSnapshot::default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
