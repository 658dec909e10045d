//! Google Generative Language (Gemini) adapter.
//!
//! Roles are `user` and `model`; tool calls are `functionCall` parts without
//! ids, so tool results are matched back by function name. Streaming uses
//! `:streamGenerateContent?alt=sse`, where every `data:` line is a complete
//! response fragment and the stream simply ends.

use std::collections::HashMap;

use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};

use super::{Credential, ProviderAdapter, insert_bearer, insert_named, json_u64, trim_base};
use crate::error::{AgentError, Result};
use crate::llm::provider::ProviderFamily;
use crate::llm::streaming::{SseLine, StreamDecoder, ToolCallAccumulator, parse_data_json, parse_sse_line};
use crate::llm::types::{
    ChatRequest, ChatResponse, Message, RateLimitSnapshot, Role, StreamChunk, TokenUsage, ToolCall,
    synthetic_call_id,
};

/// Schema keywords the Gemini function-declaration dialect rejects.
const UNSUPPORTED_SCHEMA_KEYS: &[&str] = &["$schema", "additionalProperties", "default"];

#[derive(Debug, Clone, Copy, Default)]
pub struct GoogleAdapter;

impl ProviderAdapter for GoogleAdapter {
    fn name(&self) -> &'static str {
        "google"
    }

    fn family(&self) -> ProviderFamily {
        ProviderFamily::Google
    }

    fn endpoint_url(&self, base_url: &str, model: &str, stream: bool) -> String {
        let model = model.strip_prefix("models/").unwrap_or(model);
        if stream {
            format!(
                "{}/models/{model}:streamGenerateContent?alt=sse",
                trim_base(base_url)
            )
        } else {
            format!("{}/models/{model}:generateContent", trim_base(base_url))
        }
    }

    fn headers(&self, credential: &Credential) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match credential {
            Credential::None => {}
            Credential::ApiKey(key) => insert_named(&mut headers, "x-goog-api-key", key)?,
            Credential::OAuth { token, .. } => insert_bearer(&mut headers, token)?,
        }
        Ok(headers)
    }

    fn build_request(&self, request: &ChatRequest) -> Value {
        let (system, contents) = messages_to_gemini(&request.messages);
        let mut body = json!({ "contents": contents });

        if let Some(system) = system {
            body["systemInstruction"] = json!({ "parts": [{ "text": system }] });
        }

        let mut generation = Map::new();
        if let Some(t) = request.temperature {
            generation.insert("temperature".into(), json!(t));
        }
        if let Some(p) = request.top_p {
            generation.insert("topP".into(), json!(p));
        }
        if let Some(max) = request.max_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if let Some(effort) = request.reasoning_effort {
            generation.insert(
                "thinkingConfig".into(),
                json!({ "thinkingBudget": effort.thinking_budget(), "includeThoughts": true }),
            );
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": sanitize_schema(&t.parameters),
                    })
                })
                .collect();
            body["tools"] = json!([{ "functionDeclarations": declarations }]);
        }

        body
    }

    fn parse_response(&self, v: &Value) -> Result<ChatResponse> {
        if let Some(err) = v.get("error") {
            return Err(AgentError::LlmRequestFailed {
                reason: err["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| err.to_string()),
            });
        }
        let candidate = &v["candidates"][0];
        if candidate.is_null() {
            let blocked = v["promptFeedback"]["blockReason"].as_str();
            return Err(match blocked {
                Some(reason) => AgentError::ContentPolicy {
                    reason: reason.to_owned(),
                },
                None => AgentError::LlmParseFailed {
                    reason: "missing `candidates[0]` in response".into(),
                },
            });
        }

        let mut text = String::new();
        let mut reasoning = String::new();
        let mut calls = Vec::new();
        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(call) = part.get("functionCall") {
                calls.push(ToolCall::new(
                    synthetic_call_id(),
                    call["name"].as_str().unwrap_or_default(),
                    call.get("args").cloned().unwrap_or_else(|| json!({})),
                ));
            } else if let Some(t) = part["text"].as_str() {
                if part["thought"] == true {
                    reasoning.push_str(t);
                } else {
                    text.push_str(t);
                }
            }
        }

        let reasoning = (!reasoning.is_empty()).then_some(reasoning);
        Ok(ChatResponse {
            message: Message::assistant_tool_calls(text, calls).with_reasoning(reasoning),
            usage: parse_usage(&v["usageMetadata"]),
            finish_reason: candidate["finishReason"].as_str().map(str::to_owned),
            rate_limit: RateLimitSnapshot::default(),
        })
    }

    fn stream_decoder(&self) -> Box<dyn StreamDecoder> {
        Box::new(GoogleStreamDecoder::default())
    }

    fn parse_model_list(&self, body: &Value) -> Vec<String> {
        body["models"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["name"].as_str())
                    .map(|n| n.strip_prefix("models/").unwrap_or(n).to_owned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_usage(u: &Value) -> TokenUsage {
    let prompt = json_u64(u, "promptTokenCount");
    let completion = json_u64(u, "candidatesTokenCount") + json_u64(u, "thoughtsTokenCount");
    TokenUsage {
        prompt_tokens: prompt,
        completion_tokens: completion,
        total_tokens: u["totalTokenCount"].as_u64().unwrap_or(prompt + completion),
    }
}

/// Strip schema keywords Gemini refuses, recursively.
fn sanitize_schema(schema: &Value) -> Value {
    match schema {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !UNSUPPORTED_SCHEMA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| {
                    let cleaned = if k == "properties" {
                        sanitize_properties(v)
                    } else {
                        sanitize_schema(v)
                    };
                    (k.clone(), cleaned)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(sanitize_schema).collect()),
        other => other.clone(),
    }
}

/// Property names are user data, so only their schemas are cleaned.
fn sanitize_properties(props: &Value) -> Value {
    match props {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(name, schema)| (name.clone(), sanitize_schema(schema)))
                .collect(),
        ),
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Message conversion
// ---------------------------------------------------------------------------

/// Convert canonical messages to Gemini `contents`.
///
/// Tool results reference the call by id; Gemini wants the function name,
/// so ids seen on earlier assistant messages are mapped back to names.
pub fn messages_to_gemini(messages: &[Message]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut names_by_id: HashMap<&str, &str> = HashMap::new();
    let mut contents: Vec<Value> = Vec::new();

    for msg in messages {
        let (role, parts) = match msg.role {
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
            Role::User => ("user", vec![json!({ "text": msg.content })]),
            Role::Assistant => {
                let mut parts = Vec::new();
                if !msg.content.is_empty() {
                    parts.push(json!({ "text": msg.content }));
                }
                for tc in &msg.tool_calls {
                    names_by_id.insert(tc.id.as_str(), tc.name.as_str());
                    parts.push(json!({
                        "functionCall": { "name": tc.name, "args": tc.arguments }
                    }));
                }
                if parts.is_empty() {
                    continue;
                }
                ("model", parts)
            }
            Role::Tool => {
                let name = msg
                    .tool_call_id
                    .as_deref()
                    .and_then(|id| names_by_id.get(id).copied())
                    .unwrap_or("unknown_tool");
                (
                    "user",
                    vec![json!({
                        "functionResponse": {
                            "name": name,
                            "response": { "content": msg.content },
                        }
                    })],
                )
            }
        };

        match contents.last_mut() {
            Some(last) if last["role"] == role => {
                if let Some(existing) = last["parts"].as_array_mut() {
                    existing.extend(parts);
                }
            }
            _ => contents.push(json!({ "role": role, "parts": parts })),
        }
    }

    (system, contents)
}

// ---------------------------------------------------------------------------
// Stream decoder
// ---------------------------------------------------------------------------

/// Each `data:` line is a full `GenerateContentResponse` fragment.
#[derive(Debug, Default)]
pub struct GoogleStreamDecoder {
    text: String,
    reasoning: String,
    tools: ToolCallAccumulator,
    next_call: u64,
    finish_reason: Option<String>,
    usage: TokenUsage,
}

impl StreamDecoder for GoogleStreamDecoder {
    fn feed_line(&mut self, line: &str, sink: &mut (dyn FnMut(StreamChunk) + Send)) -> Result<()> {
        let SseLine::Data(data) = parse_sse_line(line) else {
            return Ok(());
        };
        let Some(v) = parse_data_json("google", data) else {
            return Ok(());
        };

        if let Some(err) = v.get("error") {
            return Err(AgentError::LlmStreamError {
                reason: err["message"]
                    .as_str()
                    .map(str::to_owned)
                    .unwrap_or_else(|| err.to_string()),
            });
        }

        if v.get("usageMetadata").is_some() {
            self.usage = parse_usage(&v["usageMetadata"]);
        }

        let candidate = &v["candidates"][0];
        if let Some(reason) = candidate["finishReason"].as_str() {
            self.finish_reason = Some(reason.to_owned());
        }

        for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
            if let Some(call) = part.get("functionCall") {
                let index = self.next_call;
                self.next_call += 1;
                let id = synthetic_call_id();
                let name = call["name"].as_str().unwrap_or_default();
                self.tools.start(index, Some(id.as_str()), Some(name));
                self.tools
                    .set_arguments(index, call.get("args").cloned().unwrap_or_else(|| json!({})));
                sink(StreamChunk::ToolCallStarted {
                    id,
                    name: name.to_owned(),
                });
            } else if let Some(t) = part["text"].as_str().filter(|t| !t.is_empty()) {
                if part["thought"] == true {
                    self.reasoning.push_str(t);
                    sink(StreamChunk::Reasoning(t.to_owned()));
                } else {
                    self.text.push_str(t);
                    sink(StreamChunk::Text(t.to_owned()));
                }
            }
        }
        Ok(())
    }

    /// Gemini has no terminator event; the body just ends.
    fn is_done(&self) -> bool {
        false
    }

    fn has_terminator(&self) -> bool {
        false
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
