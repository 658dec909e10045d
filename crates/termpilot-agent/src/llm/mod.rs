//! LLM integration layer.
//!
//! - [`types`] -- canonical messages, requests, responses and stream chunks.
//! - [`provider`] -- provider catalog and adapter auto-detection.
//! - [`adapters`] -- per-provider wire translation (OpenAI, Anthropic, Google).
//! - [`streaming`] -- SSE line buffering and tool-call accumulation.
//! - [`client`] -- the HTTP client and the [`ChatModel`] seam.
//! - [`interview`] -- model self-configuration.

pub mod adapters;
pub mod client;
pub mod interview;
pub mod provider;
pub mod streaming;
pub mod types;

pub use adapters::{Credential, ProviderAdapter, adapter_for};
pub use client::{ChatModel, ChunkSink, LlmClient, LlmClientConfig};
pub use interview::{ModelSelfConfig, interview, static_profile};
pub use provider::{AuthMode, PROVIDERS, ProviderFamily, ProviderOption, detect_family};
pub use types::{
    ChatRequest, ChatResponse, Message, RateLimitSnapshot, ReasoningEffort, Role, StreamChunk,
    TokenUsage, ToolCall, ToolDefinition, UsageTotals,
};
