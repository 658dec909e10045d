//! Tracks whether the long prompt prefix has already reached the provider.
//!
//! The cache is advisory. The engine only elides the prefix when the
//! model reports prefix caching support; otherwise the flag drives UI
//! indicators and counters.

use serde::Serialize;

/// Why the cache was invalidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    WorkingMemory,
    LongTermSummary,
    SystemPrompt,
    Model,
    Provider,
    BaseUrl,
    Reset,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextCache {
    context_sent: bool,
    /// Messages in the last request that carried the full prefix.
    message_count: usize,
    /// Successful completions observed.
    completion_count: u64,
    hits: u64,
    invalidations: u64,
    /// Fingerprint of the prefix the flag refers to.
    #[serde(skip)]
    fingerprint: Option<u64>,
    last_invalidation: Option<Invalidation>,
}

impl ContextCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context_sent(&self) -> bool {
        self.context_sent
    }

    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn completion_count(&self) -> u64 {
        self.completion_count
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations
    }

    pub fn last_invalidation(&self) -> Option<Invalidation> {
        self.last_invalidation
    }

    /// Whether the prefix identified by `fingerprint` can be elided.
    ///
    /// A fingerprint mismatch means the prefix changed without an explicit
    /// invalidation; the cache clears itself in that case.
    pub fn can_elide(&mut self, fingerprint: u64) -> bool {
        if !self.context_sent {
            return false;
        }
        if self.fingerprint != Some(fingerprint) {
            self.invalidate(Invalidation::SystemPrompt);
            return false;
        }
        self.hits += 1;
        true
    }

    /// Record a successful response. `full_prefix` is true when the
    /// request carried the whole prefix.
    pub fn record_success(&mut self, full_prefix: bool, fingerprint: u64, message_count: usize) {
        self.completion_count += 1;
        if full_prefix {
            self.context_sent = true;
            self.fingerprint = Some(fingerprint);
            self.message_count = message_count;
        }
    }

    pub fn invalidate(&mut self, reason: Invalidation) {
        if self.context_sent {
            tracing::debug!(reason = ?reason, "context cache invalidated");
        }
        self.context_sent = false;
        self.fingerprint = None;
        self.invalidations += 1;
        self.last_invalidation = Some(reason);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
