//! Error types for the agent crate.
//!
//! All fallible operations in the agent core surface errors through
//! [`AgentError`]. [`AgentError::kind`] maps every variant onto the coarse
//! [`ErrorKind`] taxonomy that drives retry, fallback and user messaging.

use crate::recovery::{self, ErrorClass};

/// Coarse error taxonomy shared by the engine, pipeline and dual-session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Config,
    Auth,
    Transport,
    RateLimit,
    ContextLength,
    ToolValidation,
    ToolExecution,
    ToolPanic,
    Cancellation,
    ContentPolicy,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Auth => "auth",
            Self::Transport => "transport",
            Self::RateLimit => "rate_limit",
            Self::ContextLength => "context_length",
            Self::ToolValidation => "tool_validation",
            Self::ToolExecution => "tool_execution",
            Self::ToolPanic => "tool_panic",
            Self::Cancellation => "cancellation",
            Self::ContentPolicy => "content_policy",
            Self::Unknown => "unknown",
        }
    }
}

/// Top-level error type for the termpilot agent crate.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- LLM errors ---------------------------------------------------------
    /// The request could not be sent (connection, DNS, TLS, timeout).
    #[error("llm request failed: {reason}")]
    LlmRequestFailed { reason: String },

    /// The provider answered with a non-success status.
    #[error("provider returned HTTP {status}: {body}")]
    HttpStatus {
        status: u16,
        body: String,
        /// Seconds from a `retry-after` header, when present.
        retry_after_secs: Option<u64>,
    },

    /// The LLM response could not be parsed.
    #[error("failed to parse llm response: {reason}")]
    LlmParseFailed { reason: String },

    /// An error occurred while reading a streaming response.
    #[error("llm stream error: {reason}")]
    LlmStreamError { reason: String },

    /// No bytes arrived on the stream within the stall window.
    #[error("llm stream stalled for {secs}s")]
    StreamStalled { secs: u64 },

    /// No model was configured for the request.
    #[error("no model configured")]
    NoModelConfigured,

    /// No credential is available for the provider.
    #[error("missing api key for provider {provider}; set API_KEY or run /login")]
    MissingApiKey { provider: String },

    /// OAuth failure.
    #[error("oauth: {0}")]
    Auth(#[from] termpilot_auth::AuthError),

    // -- Request shaping ----------------------------------------------------
    /// The user message was empty.
    #[error("message is empty")]
    EmptyMessage,

    /// The conversation no longer fits the model context window.
    #[error("context length exceeded: {reason}")]
    ContextLength { reason: String },

    /// The provider refused the content.
    #[error("content policy violation: {reason}")]
    ContentPolicy { reason: String },

    /// The caller canceled the operation.
    #[error("operation canceled")]
    Canceled,

    // -- Tool errors --------------------------------------------------------
    /// A tool could not be registered.
    #[error("cannot register tool: {reason}")]
    ToolRegistration { reason: String },

    /// The requested tool is not registered.
    #[error("tool not found: {name}")]
    ToolNotFound { name: String },

    /// A tool handler failed.
    #[error("tool `{tool_name}` failed: {reason}")]
    ToolExecutionFailed { tool_name: String, reason: String },

    // -- Memory / persistence -----------------------------------------------
    /// Long-term memory could not be read or written.
    #[error("memory persistence failed at {path}: {reason}")]
    MemoryPersistence { path: String, reason: String },

    // -- Configuration --------------------------------------------------------
    /// Configuration is missing or invalid.
    #[error("configuration error: {reason}")]
    ConfigError { reason: String },

    /// A configuration field failed validation.
    #[error("invalid {field}: {reason}")]
    ValidationError { field: String, reason: String },

    // -- Orchestration --------------------------------------------------------
    /// The multi-agent pipeline failed.
    #[error("pipeline failed: {reason}")]
    PipelineFailed { reason: String },

    /// The dual-session orchestrator failed.
    #[error("dual session: {reason}")]
    DualSession { reason: String },

    // -- Wrapped errors -------------------------------------------------------
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Map onto the coarse taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Canceled => ErrorKind::Cancellation,
            Self::ConfigError { .. } | Self::ValidationError { .. } | Self::NoModelConfigured => {
                ErrorKind::Config
            }
            Self::MissingApiKey { .. } | Self::Auth(_) => ErrorKind::Auth,
            Self::ContextLength { .. } => ErrorKind::ContextLength,
            Self::ContentPolicy { .. } => ErrorKind::ContentPolicy,
            Self::ToolNotFound { .. } | Self::ToolRegistration { .. } => ErrorKind::ToolValidation,
            Self::ToolExecutionFailed { .. } => ErrorKind::ToolExecution,
            Self::LlmRequestFailed { .. } | Self::LlmStreamError { .. } | Self::StreamStalled { .. } => {
                ErrorKind::Transport
            }
            Self::HttpStatus { status, body, .. } => recovery::kind_for(Some(*status), body),
            Self::LlmParseFailed { reason } => recovery::kind_for(None, reason),
            _ => recovery::kind_for(None, &self.to_string()),
        }
    }

    /// Transient / permanent / permission classification.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Canceled => ErrorClass::Permanent,
            Self::StreamStalled { .. } | Self::LlmStreamError { .. } | Self::LlmRequestFailed { .. } => {
                ErrorClass::Transient
            }
            Self::HttpStatus { status, body, .. } => recovery::classify(Some(*status), body),
            Self::Auth(_) | Self::MissingApiKey { .. } => ErrorClass::Permission,
            _ => recovery::classify(None, &self.to_string()),
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// True for HTTP 401.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::HttpStatus { status: 401, .. })
    }

    /// Server-provided retry hint, from a header or the error text.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            Self::HttpStatus {
                retry_after_secs: Some(secs),
                ..
            } => Some(std::time::Duration::from_secs(*secs).min(recovery::MAX_RETRY_AFTER)),
            other => recovery::parse_retry_after(&other.to_string()),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest hides the OS-level cause (refused, reset, DNS) in the source chain.
        let mut reason = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            reason.push_str(": ");
            reason.push_str(&cause.to_string());
            source = cause.source();
        }
        if err.is_timeout() && !reason.contains("timed out") {
            reason.push_str(" (timed out)");
        }
        Self::LlmRequestFailed { reason }
    }
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AgentError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
