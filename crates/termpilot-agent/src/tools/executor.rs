//! Panic-safe tool execution.
//!
//! [`ToolExecutor::execute`] never fails and never panics: lookup misses,
//! permission denials, schema mismatches, handler errors, timeouts and
//! handler panics all come back as a failed [`ToolResult`] the model can
//! read and react to. Each call leaves a [`ToolTrace`] and, when an audit
//! log is attached, an [`AuditRecord`].

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AgentError;
use crate::llm::types::{ToolCall, ToolDefinition};
use crate::recovery::error_log;
use crate::tools::audit::{AuditLog, AuditRecord};
use crate::tools::permissions::{Approver, Gate, PermissionPolicy};
use crate::tools::registry::ToolRegistry;
use crate::tools::{ToolContext, ToolDispatch, ToolFilter, ToolResult};

/// Per-handler time limit.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of traces kept for inspection.
const TRACE_CAPACITY: usize = 200;

/// Where a failed execution went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Unknown tool, denied permission or bad arguments.
    Validation,
    Execution,
    Panic,
}

/// Debug record of one execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolTrace {
    pub id: Uuid,
    pub call_id: String,
    pub tool: String,
    pub arguments: Value,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub category: Option<ErrorCategory>,
    pub error: Option<String>,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: PermissionPolicy,
    approver: Option<Arc<dyn Approver>>,
    audit: Option<Arc<AuditLog>>,
    timeout: Duration,
    traces: Mutex<VecDeque<ToolTrace>>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            registry,
            policy: PermissionPolicy::default(),
            approver: None,
            audit: None,
            timeout: DEFAULT_TOOL_TIMEOUT,
            traces: Mutex::new(VecDeque::new()),
        }
    }

    pub fn with_policy(mut self, policy: PermissionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    pub fn with_audit(mut self, audit: Arc<AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> &PermissionPolicy {
        &self.policy
    }

    /// Recent traces, oldest first.
    pub fn traces(&self) -> Vec<ToolTrace> {
        self.traces
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Execute `call` and return its result together with the trace.
    pub async fn execute_traced(&self, call: &ToolCall, cancel: &CancellationToken) -> (ToolResult, ToolTrace) {
        self.execute_traced_with(call, ToolFilter::All, cancel).await
    }

    /// Like [`execute_traced`](Self::execute_traced), for a caller that may
    /// only use tools passing `filter`. Other tools count as not found.
    pub async fn execute_traced_with(
        &self,
        call: &ToolCall,
        filter: ToolFilter,
        cancel: &CancellationToken,
    ) -> (ToolResult, ToolTrace) {
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::debug!(tool = %call.name, call_id = %call.id, filter = ?filter, "executing tool");

        let (result, category) = self.dispatch(call, filter, cancel).await;
        let (result, category) = normalize(result, category);
        let duration_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);

        let trace = ToolTrace {
            id: Uuid::now_v7(),
            call_id: call.id.clone(),
            tool: call.name.clone(),
            arguments: call.arguments.clone(),
            started_at,
            duration_ms,
            success: result.success,
            category,
            error: result.error.clone(),
        };

        if result.success {
            tracing::info!(tool = %call.name, duration_ms, "tool completed");
        } else {
            tracing::warn!(
                tool = %call.name,
                duration_ms,
                category = ?category,
                error = result.error.as_deref().unwrap_or_default(),
                "tool failed"
            );
        }

        if let Some(audit) = &self.audit {
            audit
                .record(AuditRecord::new(
                    &call.name,
                    &call.arguments,
                    result.success,
                    duration_ms,
                    category,
                ))
                .await;
        }

        {
            let mut traces = self.traces.lock().unwrap_or_else(PoisonError::into_inner);
            if traces.len() >= TRACE_CAPACITY {
                traces.pop_front();
            }
            traces.push_back(trace.clone());
        }

        (result, trace)
    }

    async fn dispatch(
        &self,
        call: &ToolCall,
        filter: ToolFilter,
        cancel: &CancellationToken,
    ) -> (ToolResult, Option<ErrorCategory>) {
        let validation = |msg: String| (ToolResult::failure(msg), Some(ErrorCategory::Validation));

        let Some(tool) = self.registry.get(&call.name).filter(|t| filter.permits(t.read_only)) else {
            return validation(
                AgentError::ToolNotFound {
                    name: call.name.clone(),
                }
                .to_string(),
            );
        };

        match self.policy.check(&tool.name, tool.sensitive) {
            Gate::Allow => {}
            Gate::Deny(reason) => return validation(reason),
            Gate::NeedsApproval => {
                let approved = match &self.approver {
                    Some(approver) => approver.approve(&tool.name, &call.arguments).await,
                    None => false,
                };
                if !approved {
                    return validation(format!("permission denied: {}", tool.name));
                }
            }
        }

        if let Err(issues) = tool.schema.validate(&call.arguments) {
            return validation(format!("invalid arguments for {}: {}", tool.name, issues.join("; ")));
        }

        if cancel.is_cancelled() {
            return (
                ToolResult::failure(AgentError::Canceled.to_string()),
                Some(ErrorCategory::Execution),
            );
        }

        let ctx = ToolContext {
            call_id: call.id.clone(),
            cancel: cancel.child_token(),
        };
        let arguments = tool.schema.apply_defaults(call.arguments.clone());
        let running = AssertUnwindSafe(tool.handler.call(arguments, ctx)).catch_unwind();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => (
                ToolResult::failure(AgentError::Canceled.to_string()),
                Some(ErrorCategory::Execution),
            ),
            outcome = tokio::time::timeout(self.timeout, running) => match outcome {
                Err(_) => (
                    ToolResult::failure(format!("tool timed out after {}s", self.timeout.as_secs())),
                    Some(ErrorCategory::Execution),
                ),
                Ok(Err(payload)) => {
                    let message = format!("PANIC: {}", panic_message(payload.as_ref()));
                    error_log::global().record(&message, &call.name, "tool.execute", true);
                    (ToolResult::failure(message), Some(ErrorCategory::Panic))
                }
                Ok(Ok(Err(e))) => (ToolResult::failure(e.to_string()), Some(ErrorCategory::Execution)),
                Ok(Ok(Ok(result))) if result.success => (result, None),
                Ok(Ok(Ok(result))) => (result, Some(ErrorCategory::Execution)),
            },
        }
    }
}

/// A result never claims success while carrying an error.
fn normalize(mut result: ToolResult, category: Option<ErrorCategory>) -> (ToolResult, Option<ErrorCategory>) {
    if result.error.as_deref().is_some_and(|e| e.trim().is_empty()) {
        result.error = None;
    }
    if result.success && result.error.is_some() {
        result.success = false;
        return (result, Some(category.unwrap_or(ErrorCategory::Execution)));
    }
    if !result.success && result.error.is_none() {
        result.error = Some("tool reported failure".into());
    }
    let category = if result.success { None } else { category.or(Some(ErrorCategory::Execution)) };
    (result, category)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

#[async_trait]
impl ToolDispatch for ToolExecutor {
    async fn execute_filtered(&self, call: &ToolCall, filter: ToolFilter, cancel: &CancellationToken) -> ToolResult {
        self.execute_traced_with(call, filter, cancel).await.0
    }

    fn definitions(&self, filter: ToolFilter) -> Vec<ToolDefinition> {
        self.registry.export(filter)
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("registry", &self.registry)
            .field("timeout", &self.timeout)
            .field("has_approver", &self.approver.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
