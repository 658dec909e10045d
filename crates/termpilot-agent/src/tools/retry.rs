//! Intelligent retry around the tool executor.
//!
//! Failed executions are classified. Transient failures are re-issued
//! after a short backoff; input-shape failures are re-issued once the
//! arguments can be coerced to the declared schema. Everything else is
//! returned at once. When the final attempt still fails, the result output
//! is prefixed with feedback telling the model what to change.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::llm::types::{ToolCall, ToolDefinition};
use crate::recovery::{self, BackoffPolicy, ErrorClass};
use crate::tools::executor::ToolExecutor;
use crate::tools::{ToolDispatch, ToolFilter, ToolResult};

/// Re-issues allowed beyond the first attempt.
pub const MAX_EXTRA_ATTEMPTS: u32 = 2;

/// Why a tool call failed, from the retry layer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Permission,
    InputShape,
    NotSupported,
    Unknown,
}

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "not allowed",
    "access denied",
    "access is denied",
    "operation not permitted",
    "forbidden",
    "unauthorized",
];

const INPUT_SHAPE_MARKERS: &[&str] = &[
    "invalid arguments",
    "missing required",
    "must be of type",
    "must be one of",
    "invalid type",
    "expected",
    "invalid value",
];

const NOT_SUPPORTED_MARKERS: &[&str] = &[
    "tool not found",
    "not supported",
    "unsupported",
    "not implemented",
    "command not found",
    "unknown command",
];

const EXTRA_TRANSIENT_MARKERS: &[&str] = &[
    "resource busy",
    "try again",
    "temporarily",
    "unavailable",
    "would block",
];

pub fn classify_failure(error: &str) -> FailureClass {
    let lower = error.to_lowercase();
    let has = |markers: &[&str]| markers.iter().any(|m| lower.contains(m));

    if lower.starts_with("panic:") || lower.contains("operation canceled") {
        FailureClass::Unknown
    } else if has(PERMISSION_MARKERS) {
        FailureClass::Permission
    } else if has(NOT_SUPPORTED_MARKERS) {
        FailureClass::NotSupported
    } else if has(INPUT_SHAPE_MARKERS) {
        FailureClass::InputShape
    } else if has(EXTRA_TRANSIENT_MARKERS) || recovery::classify(None, &lower) == ErrorClass::Transient {
        FailureClass::Transient
    } else {
        FailureClass::Unknown
    }
}

static MISSING_PARAM: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"missing required parameter `([^`]+)`").ok());
static WRONG_TYPE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"parameter `([^`]+)` must be of type (\w+)").ok());
static WRONG_ENUM: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"parameter `([^`]+)` must be one of (\[[^\]]*\])").ok());

fn collect_hints(
    re: &LazyLock<Option<Regex>>,
    error: &str,
    render: impl Fn(&regex::Captures<'_>) -> String,
    out: &mut Vec<String>,
) {
    if let Some(re) = LazyLock::force(re) {
        out.extend(re.captures_iter(error).map(|caps| render(&caps)));
    }
}

/// What the model should change, derived from the error text.
pub fn adjustment_hint(class: FailureClass, error: &str) -> String {
    match class {
        FailureClass::InputShape => {
            let mut hints = Vec::new();
            collect_hints(&MISSING_PARAM, error, |c| format!("provide `{}`", &c[1]), &mut hints);
            collect_hints(&WRONG_TYPE, error, |c| format!("send `{}` as {}", &c[1], &c[2]), &mut hints);
            collect_hints(&WRONG_ENUM, error, |c| format!("set `{}` to one of {}", &c[1], &c[2]), &mut hints);
            if hints.is_empty() {
                "the arguments to match the tool schema".into()
            } else {
                hints.join(", ")
            }
        }
        FailureClass::Transient => "nothing; retry later or try a smaller request".into(),
        FailureClass::Permission => "the request to stay within allowed tools and paths".into(),
        FailureClass::NotSupported => "the approach; use a different tool".into(),
        FailureClass::Unknown => "the approach based on the error".into(),
    }
}

/// Executor wrapper that re-issues recoverable failures.
#[derive(Debug)]
pub struct RetryingExecutor {
    inner: Arc<ToolExecutor>,
    backoff: BackoffPolicy,
}

impl RetryingExecutor {
    pub fn new(inner: Arc<ToolExecutor>) -> Self {
        Self {
            inner,
            backoff: BackoffPolicy::new(
                Duration::from_millis(250),
                Duration::from_secs(2),
                2.0,
                MAX_EXTRA_ATTEMPTS + 1,
            ),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn inner(&self) -> &Arc<ToolExecutor> {
        &self.inner
    }

    async fn run(&self, call: &ToolCall, filter: ToolFilter, cancel: &CancellationToken) -> ToolResult {
        let mut current = call.clone();
        let mut extra = 0u32;
        loop {
            let result = self.inner.execute_filtered(&current, filter, cancel).await;
            if result.success || cancel.is_cancelled() {
                return result;
            }
            let error = result.error.clone().unwrap_or_default();
            let class = classify_failure(&error);

            let next = match class {
                FailureClass::Transient => Some(current.clone()),
                FailureClass::InputShape => self
                    .inner
                    .registry()
                    .get(&current.name)
                    .and_then(|tool| tool.schema.coerce(&current.arguments))
                    .map(|arguments| ToolCall {
                        arguments,
                        ..current.clone()
                    }),
                _ => None,
            };

            match next {
                Some(next) if extra < MAX_EXTRA_ATTEMPTS => {
                    tracing::info!(
                        tool = %current.name,
                        attempt = extra + 2,
                        class = ?class,
                        "re-issuing failed tool call"
                    );
                    if recovery::sleep_or_cancel(self.backoff.delay(extra), cancel).await.is_err() {
                        return result;
                    }
                    extra += 1;
                    current = next;
                }
                _ => return with_feedback(result, class, &error),
            }
        }
    }
}

fn with_feedback(mut result: ToolResult, class: FailureClass, error: &str) -> ToolResult {
    let feedback = format!(
        "last attempt failed because {error}; please adjust {}",
        adjustment_hint(class, error)
    );
    result.output = if result.output.is_empty() {
        feedback
    } else {
        format!("{feedback}\n{}", result.output)
    };
    result
}

#[async_trait]
impl ToolDispatch for RetryingExecutor {
    async fn execute_filtered(&self, call: &ToolCall, filter: ToolFilter, cancel: &CancellationToken) -> ToolResult {
        self.run(call, filter, cancel).await
    }

    fn definitions(&self, filter: ToolFilter) -> Vec<ToolDefinition> {
        self.inner.definitions(filter)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::registry::{ToolRegistry, ToolSpec};
    use crate::tools::schema::{ParamType, ToolSchema};
    use crate::tools::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn classifies_common_failures() {
        assert_eq!(classify_failure("tool timed out after 60s"), FailureClass::Transient);
        assert_eq!(classify_failure("Resource busy, try again"), FailureClass::Transient);
        assert_eq!(classify_failure("permission denied: rm"), FailureClass::Permission);
        assert_eq!(
            classify_failure("invalid arguments for echo: missing required parameter `text`"),
            FailureClass::InputShape
        );
        assert_eq!(classify_failure("tool not found: nope"), FailureClass::NotSupported);
        assert_eq!(classify_failure("PANIC: timeout in handler"), FailureClass::Unknown);
        assert_eq!(classify_failure("exit status 2"), FailureClass::Unknown);
    }

    #[test]
    fn hints_name_the_parameters() {
        let hint = adjustment_hint(
            FailureClass::InputShape,
            "missing required parameter `path`; parameter `limit` must be of type integer, got string",
        );
        assert_eq!(hint, "provide `path`, send `limit` as integer");
    }

    fn flaky_registry(failures: u32, counter: Arc<AtomicU32>) -> Arc<ToolRegistry> {
        let reg = ToolRegistry::new();
        reg.register(ToolSpec::new("flaky", "Fails a few times").handler(handler_fn(move |_, _| {
            let counter = Arc::clone(&counter);
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < failures {
                    Ok(ToolResult::failure("resource temporarily unavailable"))
                } else {
                    Ok(ToolResult::ok("done"))
                }
            }
        })))
        .unwrap();
        reg.register(
            ToolSpec::new("count", "Needs an integer")
                .schema(ToolSchema::new().required("n", ParamType::Integer, "Count"))
                .handler(handler_fn(|args, _| async move { Ok(ToolResult::ok(args["n"].to_string())) })),
        )
        .unwrap();
        Arc::new(reg)
    }

    fn retrying(reg: Arc<ToolRegistry>) -> RetryingExecutor {
        RetryingExecutor::new(Arc::new(ToolExecutor::new(reg))).with_backoff(BackoffPolicy::new(
            Duration::from_millis(1),
            Duration::from_millis(2),
            2.0,
            3,
        ))
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let exec = retrying(flaky_registry(2, Arc::clone(&counter)));
        let res = exec
            .execute(&ToolCall::new("c1", "flaky", json!({})), &CancellationToken::new())
            .await;
        assert!(res.success);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_two_extra_attempts_with_feedback() {
        let counter = Arc::new(AtomicU32::new(0));
        let exec = retrying(flaky_registry(10, Arc::clone(&counter)));
        let res = exec
            .execute(&ToolCall::new("c1", "flaky", json!({})), &CancellationToken::new())
            .await;
        assert!(!res.success);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(res.output.starts_with("last attempt failed because resource temporarily unavailable; please adjust"));
    }

    #[tokio::test]
    async fn input_shape_is_coerced() {
        let exec = retrying(flaky_registry(0, Arc::new(AtomicU32::new(0))));
        let res = exec
            .execute(&ToolCall::new("c1", "count", json!({"n": "7"})), &CancellationToken::new())
            .await;
        assert!(res.success);
        assert_eq!(res.output, "7");
    }

    #[tokio::test]
    async fn uncoercible_input_gets_feedback() {
        let exec = retrying(flaky_registry(0, Arc::new(AtomicU32::new(0))));
        let res = exec
            .execute(&ToolCall::new("c1", "count", json!({})), &CancellationToken::new())
            .await;
        assert!(!res.success);
        assert!(res.output.contains("please adjust provide `n`"));
    }
}
