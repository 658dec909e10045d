//! Provider adapters.
//!
//! An adapter owns everything provider-specific: endpoint paths, auth
//! headers, request/response translation, stream decoding and rate-limit
//! headers. The [`LlmClient`](crate::llm::client::LlmClient) composes one
//! adapter with the HTTP transport.

pub mod anthropic;
pub mod google;
pub mod openai;

use std::sync::Arc;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::provider::ProviderFamily;
use crate::llm::streaming::StreamDecoder;
use crate::llm::types::{ChatRequest, ChatResponse, RateLimitSnapshot};

pub use anthropic::AnthropicAdapter;
pub use google::GoogleAdapter;
pub use openai::OpenAiAdapter;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// The secret attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// No authentication (local servers).
    None,
    /// A provider API key.
    ApiKey(String),
    /// An OAuth access token, sent as a bearer token.
    OAuth {
        token: String,
        account_id: Option<String>,
    },
}

impl Credential {
    /// The raw secret, if any.
    pub fn secret(&self) -> Option<&str> {
        match self {
            Self::None => None,
            Self::ApiKey(k) => Some(k),
            Self::OAuth { token, .. } => Some(token),
        }
    }

    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::OAuth { .. })
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("Credential::None"),
            Self::ApiKey(_) => f.write_str("Credential::ApiKey(***)"),
            Self::OAuth { account_id, .. } => f
                .debug_struct("Credential::OAuth")
                .field("token", &"***")
                .field("account_id", account_id)
                .finish(),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter trait
// ---------------------------------------------------------------------------

/// Translation layer between canonical types and one provider's wire format.
pub trait ProviderAdapter: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn family(&self) -> ProviderFamily;

    /// Full URL for a chat call.
    fn endpoint_url(&self, base_url: &str, model: &str, stream: bool) -> String;

    /// Authentication and protocol headers.
    fn headers(&self, credential: &Credential) -> Result<HeaderMap>;

    /// Canonical request to wire JSON.
    fn build_request(&self, request: &ChatRequest) -> Value;

    /// Wire JSON to canonical response (non-streaming).
    fn parse_response(&self, body: &Value) -> Result<ChatResponse>;

    /// Fresh decoder for one streamed response.
    fn stream_decoder(&self) -> Box<dyn StreamDecoder>;

    /// Remaining-quota headers, when the provider sends them.
    fn rate_limits(&self, headers: &HeaderMap) -> RateLimitSnapshot {
        RateLimitSnapshot {
            remaining_tokens: header_u64(headers, "x-ratelimit-remaining-tokens")
                .or_else(|| header_u64(headers, "anthropic-ratelimit-tokens-remaining")),
            remaining_requests: header_u64(headers, "x-ratelimit-remaining-requests")
                .or_else(|| header_u64(headers, "anthropic-ratelimit-requests-remaining")),
        }
    }

    fn supports_model_listing(&self) -> bool {
        true
    }

    fn models_url(&self, base_url: &str) -> String {
        format!("{}/models", trim_base(base_url))
    }

    /// Extract model ids from a listing response.
    fn parse_model_list(&self, body: &Value) -> Vec<String> {
        body["data"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m["id"].as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The adapter for a wire family.
pub fn adapter_for(family: ProviderFamily) -> Arc<dyn ProviderAdapter> {
    match family {
        ProviderFamily::OpenAi => Arc::new(OpenAiAdapter),
        ProviderFamily::Anthropic => Arc::new(AnthropicAdapter),
        ProviderFamily::Google => Arc::new(GoogleAdapter),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Base URL without trailing slashes.
pub(crate) fn trim_base(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

pub(crate) fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Seconds from a `retry-after` header (integer form only).
pub fn retry_after_header(headers: &HeaderMap) -> Option<u64> {
    header_u64(headers, "retry-after")
}

pub(crate) fn header_value(value: &str, what: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| AgentError::LlmRequestFailed {
        reason: format!("invalid {what} header: {e}"),
    })
}

pub(crate) fn insert_bearer(headers: &mut HeaderMap, token: &str) -> Result<()> {
    headers.insert(
        AUTHORIZATION,
        header_value(&format!("Bearer {token}"), "authorization")?,
    );
    Ok(())
}

pub(crate) fn insert_named(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<()> {
    headers.insert(HeaderName::from_static(name), header_value(value, name)?);
    Ok(())
}

/// Read `usage`-style integer fields, tolerating absence.
pub(crate) fn json_u64(v: &Value, key: &str) -> u64 {
    v[key].as_u64().unwrap_or(0)
}

/// Parse a tool-call argument string, keeping non-JSON text under `_raw`.
pub(crate) fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return Value::Object(Default::default());
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "_raw": raw }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_headers_both_styles() {
        let mut h = HeaderMap::new();
        h.insert("x-ratelimit-remaining-tokens", HeaderValue::from_static("1200"));
        h.insert(
            "anthropic-ratelimit-requests-remaining",
            HeaderValue::from_static("49"),
        );
        let rl = OpenAiAdapter.rate_limits(&h);
        assert_eq!(rl.remaining_tokens, Some(1200));
        assert_eq!(rl.remaining_requests, Some(49));
        assert!(OpenAiAdapter.rate_limits(&HeaderMap::new()).is_empty());
    }

    #[test]
    fn credential_debug_hides_secret() {
        let dbg = format!("{:?}", Credential::ApiKey("sk-secret".into()));
        assert!(!dbg.contains("sk-secret"));
    }

    #[test]
    fn non_json_arguments_are_preserved() {
        assert_eq!(parse_arguments("oops")["_raw"], "oops");
        assert_eq!(parse_arguments(" "), serde_json::json!({}));
    }

    #[test]
    fn adapter_for_matches_family() {
        for family in [
            ProviderFamily::OpenAi,
            ProviderFamily::Anthropic,
            ProviderFamily::Google,
        ] {
            assert_eq!(adapter_for(family).family(), family);
        }
    }
}
