//! Conversation core for the termpilot terminal assistant.
//!
//! The crate turns one user message into one assistant answer: it assembles
//! a prompt from tiered memory, streams the model's reply, executes the
//! tool calls the model asks for and loops until the model answers in
//! plain text.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │   Pipeline   │   │ DualSession │   │     CLI      │
//! └──────┬───────┘   └──────┬──────┘   └──────┬───────┘
//!        └───────── TurnAgent ────────────────┘
//!                       │
//!                 ┌─────┴─────┐
//!                 │   Agent   │── memory ── context cache
//!                 └──┬─────┬──┘
//!          ChatModel │     │ ToolDispatch
//!           ┌────────┴┐   ┌┴─────────────┐
//!           │LlmClient│   │ ToolExecutor │
//!           └────┬────┘   └──────────────┘
//!        adapters + SSE
//! ```
//!
//! ## Modules
//!
//! - [`llm`] -- wire types, provider adapters, SSE parsing and the client.
//! - [`agent`] -- the conversation engine and its per-turn loop.
//! - [`tools`] -- registry, schema validation, executor, retry wrapper, audit.
//! - [`memory`] -- short-term, working and long-term memory.
//! - [`context_cache`] -- tracks whether the prompt prefix was already sent.
//! - [`prompt`] -- system prompt assembly and fingerprinting.
//! - [`pipeline`] -- planner, researcher, executor and critic roles.
//! - [`dual_session`] -- two agents debating in alternating turns.
//! - [`recovery`] -- error classification, backoff and the global error log.
//! - [`config`] -- the JSON configuration document.
//! - [`error`] -- agent error types.

pub mod agent;
pub mod config;
pub mod context_cache;
pub mod dual_session;
pub mod error;
pub mod llm;
pub mod memory;
pub mod pipeline;
pub mod prompt;
pub mod recovery;
pub mod tools;

// Re-export the most commonly used types at the crate root.
pub use agent::{Agent, AgentConfig, AgentObserver, NoopObserver, TOOL_BUDGET_EXHAUSTED, TurnAgent};
pub use config::{Config, Env, LoadedConfig};
pub use context_cache::{ContextCache, Invalidation};
pub use dual_session::{DebateSetup, DualMessage, DualObserver, DualSession, DualSessionConfig, DualStats};
pub use error::{AgentError, ErrorKind, Result};
pub use llm::{
    ChatModel, ChatRequest, ChatResponse, ChunkSink, LlmClient, LlmClientConfig, Message, ReasoningEffort, Role,
    StreamChunk, ToolCall, ToolDefinition, UsageTotals,
};
pub use memory::{MemoryConfig, MemoryItem, MemoryKind, MemoryManager, MemoryTier};
pub use pipeline::{BrainFileSink, Insight, InsightSink, Pipeline, PipelineConfig, PipelineRole};
pub use prompt::PromptProfile;
pub use tools::{
    ToolContext, ToolDispatch, ToolExecutor, ToolFilter, ToolHandler, ToolRegistry, ToolResult, ToolSchema, ToolSpec,
    handler_fn,
};
