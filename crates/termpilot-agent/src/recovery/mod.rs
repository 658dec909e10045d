//! Failure classification and retry policy.
//!
//! Every retry decision in the crate goes through this module: the LLM
//! client's transport retries, the engine's fallback chain and the
//! dual-session turn retries all call [`classify`] and [`BackoffPolicy`].

pub mod error_log;

use std::future::Future;
use std::sync::LazyLock;
use std::time::Duration;

use rand::Rng;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ErrorKind, Result};

pub use error_log::{ErrorLog, ErrorRecord};

/// Retry class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a delay.
    Transient,
    /// Retrying will fail the same way.
    Permanent,
    /// Credentials are missing, wrong or expired.
    Permission,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

const TRANSIENT_MARKERS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "connection refused",
    "connection reset",
    "connection closed",
    "temporary failure",
    "temporarily unavailable",
    "timed out",
    "timeout",
    "overloaded",
    "stream stalled",
];

const PERMISSION_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "permission denied",
    "invalid api key",
    "invalid x-api-key",
    "authentication",
];

const CONTEXT_LENGTH_MARKERS: &[&str] = &[
    "context length",
    "context_length",
    "maximum context",
    "context window",
    "too many tokens",
    "prompt is too long",
    "reduce the length",
];

const CONTENT_POLICY_MARKERS: &[&str] = &[
    "content policy",
    "content_policy",
    "content_filter",
    "safety system",
    "flagged as inappropriate",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Whether the text describes a context-window overflow.
pub fn is_context_length_text(text: &str) -> bool {
    contains_any(&text.to_lowercase(), CONTEXT_LENGTH_MARKERS)
}

/// Whether the text describes a content-policy rejection.
pub fn is_content_policy_text(text: &str) -> bool {
    contains_any(&text.to_lowercase(), CONTENT_POLICY_MARKERS)
}

/// Whether the text describes a rate limit.
pub fn is_rate_limit_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    lower.contains("rate limit") || lower.contains("rate_limit") || lower.contains("too many requests")
}

/// Classify a failure from its HTTP status (if any) and message text.
///
/// 429/502/503/504 are transient; 401/403 are permission errors; any other
/// 4xx is permanent. Without a decisive status the text decides, and
/// content-policy rejections are always permanent.
pub fn classify(status: Option<u16>, text: &str) -> ErrorClass {
    let lower = text.to_lowercase();
    if contains_any(&lower, CONTENT_POLICY_MARKERS) {
        return ErrorClass::Permanent;
    }

    match status {
        Some(429 | 502 | 503 | 504) => return ErrorClass::Transient,
        Some(401 | 403) => return ErrorClass::Permission,
        Some(s) if (400..500).contains(&s) => return ErrorClass::Permanent,
        _ => {}
    }

    if contains_any(&lower, TRANSIENT_MARKERS) {
        ErrorClass::Transient
    } else if contains_any(&lower, PERMISSION_MARKERS) {
        ErrorClass::Permission
    } else {
        ErrorClass::Permanent
    }
}

/// Map a status/text pair onto the [`ErrorKind`] taxonomy.
pub fn kind_for(status: Option<u16>, text: &str) -> ErrorKind {
    let lower = text.to_lowercase();
    if contains_any(&lower, CONTENT_POLICY_MARKERS) {
        return ErrorKind::ContentPolicy;
    }
    if contains_any(&lower, CONTEXT_LENGTH_MARKERS) {
        return ErrorKind::ContextLength;
    }
    match status {
        Some(401 | 403) => return ErrorKind::Auth,
        Some(429) => return ErrorKind::RateLimit,
        Some(502 | 503 | 504) => return ErrorKind::Transport,
        _ => {}
    }
    if is_rate_limit_text(&lower) {
        ErrorKind::RateLimit
    } else if contains_any(&lower, TRANSIENT_MARKERS) {
        ErrorKind::Transport
    } else if contains_any(&lower, PERMISSION_MARKERS) {
        ErrorKind::Auth
    } else {
        ErrorKind::Unknown
    }
}

static RETRY_AFTER_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry[\s_-]*after|try again in)[\s:=]*(\d+(?:\.\d+)?)\s*(ms|milliseconds?|s|secs?|seconds?|m|mins?|minutes?)?",
    )
    .ok()
});

/// Longest server retry hint honored.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Extract a "retry after N" hint from error text, clamped to
/// [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(text: &str) -> Option<Duration> {
    let re = LazyLock::force(&RETRY_AFTER_RE).as_ref()?;
    let caps = re.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps
        .get(2)
        .map(|m| m.as_str().to_lowercase())
        .unwrap_or_default();
    let secs = if unit.starts_with("ms") || unit.starts_with("milli") {
        value / 1000.0
    } else if unit.starts_with('m') {
        value * 60.0
    } else {
        value
    };
    let secs = secs.clamp(0.0, MAX_RETRY_AFTER.as_secs_f64());
    Duration::try_from_secs_f64(secs).ok()
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter.
///
/// `delay(k) = min(cap, base * multiplier^k) * (1 ± jitter)`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub multiplier: f64,
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    /// Relative jitter, e.g. `0.1` for ±10%.
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
            multiplier: 2.0,
            max_attempts: 3,
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration, multiplier: f64, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            multiplier,
            max_attempts,
            jitter: 0.1,
        }
    }

    /// Policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `k` (0-based) without jitter.
    pub fn nominal_delay(&self, k: u32) -> Duration {
        let exp = self.multiplier.powi(k.min(63) as i32);
        let raw = self.base.as_secs_f64() * exp;
        Duration::from_secs_f64(raw.min(self.cap.as_secs_f64()))
    }

    /// Delay before retry number `k` (0-based) with jitter applied.
    pub fn delay(&self, k: u32) -> Duration {
        let nominal = self.nominal_delay(k).as_secs_f64();
        if self.jitter <= 0.0 {
            return Duration::from_secs_f64(nominal);
        }
        let factor = rand::thread_rng().gen_range((1.0 - self.jitter)..=(1.0 + self.jitter));
        Duration::from_secs_f64(nominal * factor)
    }

    /// True only when the failure is transient, `attempt` (attempts made so
    /// far) is below the limit, and the caller asserts idempotency.
    pub fn should_retry(&self, class: ErrorClass, attempt: u32, idempotent: bool) -> bool {
        class == ErrorClass::Transient && attempt < self.max_attempts && idempotent
    }
}

/// Sleep for `delay` unless `cancel` fires first.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AgentError::Canceled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Run `op` under `policy`, retrying transient failures.
///
/// A server retry hint takes precedence over the computed delay.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &BackoffPolicy,
    idempotent: bool,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(AgentError::Canceled);
        }
        let result = op(attempt).await;
        attempt += 1;
        match result {
            Ok(value) => return Ok(value),
            Err(err) if err.is_canceled() => return Err(err),
            Err(err) => {
                if !policy.should_retry(err.class(), attempt, idempotent) {
                    return Err(err);
                }
                let delay = err
                    .retry_after()
                    .unwrap_or_else(|| policy.delay(attempt - 1));
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                error_log::global().record(&err, operation, operation, true);
                sleep_or_cancel(delay, cancel).await?;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
