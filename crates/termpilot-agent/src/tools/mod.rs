//! Tool registry and execution.
//!
//! - [`schema`] -- parameter schemas and argument validation.
//! - [`registry`] -- the thread-safe name → tool map.
//! - [`permissions`] -- allow-lists, sensitive tools and approval.
//! - [`executor`] -- panic-safe dispatch with traces and timeouts.
//! - [`retry`] -- failure classification and bounded re-issue.
//! - [`audit`] -- append-only execution log.

pub mod audit;
pub mod executor;
pub mod permissions;
pub mod registry;
pub mod retry;
pub mod schema;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::llm::types::{ToolCall, ToolDefinition};

pub use audit::{AuditLog, AuditRecord};
pub use executor::{DEFAULT_TOOL_TIMEOUT, ErrorCategory, ToolExecutor, ToolTrace};
pub use permissions::{Approver, AutoApprove, DenyAll, PermissionPolicy};
pub use registry::{ToolRegistry, ToolSpec};
pub use retry::{FailureClass, RetryingExecutor};
pub use schema::{ParamType, ToolSchema};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            data: None,
            error: None,
        }
    }

    pub fn ok_with_data(output: impl Into<String>, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::ok(output)
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            data: None,
            error: Some(error.into()),
        }
    }

    /// Text fed back to the model as the tool message content.
    pub fn to_message_content(&self) -> String {
        match (&self.error, self.success) {
            (Some(err), false) if self.output.is_empty() => format!("Error: {err}"),
            (Some(err), false) => format!("{}\nError: {err}", self.output),
            _ => self.output.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handler seam
// ---------------------------------------------------------------------------

/// Per-call context handed to handlers.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub call_id: String,
    /// Handlers should observe this around blocking work.
    pub cancel: CancellationToken,
}

/// Implementation behind a registered tool.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, arguments: Value, ctx: ToolContext) -> Result<ToolResult>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ToolHandler for FnHandler<F>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolResult>> + Send,
{
    async fn call(&self, arguments: Value, ctx: ToolContext) -> Result<ToolResult> {
        (self.0)(arguments, ctx).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn ToolHandler>
where
    F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<ToolResult>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ---------------------------------------------------------------------------
// Dispatch seam
// ---------------------------------------------------------------------------

/// Which registered tools a caller may see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolFilter {
    #[default]
    All,
    /// Only tools registered as read-only.
    ReadOnly,
    /// No tools at all.
    None,
}

impl ToolFilter {
    /// Whether a tool with the given read-only flag passes the filter.
    pub fn permits(self, read_only: bool) -> bool {
        match self {
            Self::All => true,
            Self::ReadOnly => read_only,
            Self::None => false,
        }
    }
}

/// What the conversation engine needs from a tool executor.
#[async_trait]
pub trait ToolDispatch: Send + Sync {
    /// Execute one call on behalf of a caller limited to `filter`.
    /// Failures, including calls to tools outside the filter, are reported
    /// inside the result.
    async fn execute_filtered(&self, call: &ToolCall, filter: ToolFilter, cancel: &CancellationToken) -> ToolResult;

    /// Execute one call with every registered tool available.
    async fn execute(&self, call: &ToolCall, cancel: &CancellationToken) -> ToolResult {
        self.execute_filtered(call, ToolFilter::All, cancel).await
    }

    /// Tool definitions in wire shape.
    fn definitions(&self, filter: ToolFilter) -> Vec<ToolDefinition>;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
