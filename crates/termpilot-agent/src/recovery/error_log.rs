//! Process-wide error log.
//!
//! A bounded ring of recent failures, readable as a snapshot or as a live
//! [`broadcast`] stream for UI layers. The global instance is created on
//! first use.

use std::collections::VecDeque;
use std::fmt::Display;
use std::sync::{Mutex, OnceLock, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

/// Default number of records kept in memory.
pub const DEFAULT_ERROR_LOG_CAPACITY: usize = 1000;

/// One recorded failure.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub timestamp: DateTime<Utc>,
    pub error: String,
    pub context: String,
    pub operation: String,
    pub recovered: bool,
    /// Captured when `RUST_BACKTRACE` is enabled.
    pub stack_trace: Option<String>,
}

/// Bounded ring buffer of [`ErrorRecord`]s.
#[derive(Debug)]
pub struct ErrorLog {
    capacity: usize,
    entries: Mutex<VecDeque<ErrorRecord>>,
    tx: broadcast::Sender<ErrorRecord>,
}

impl Default for ErrorLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_ERROR_LOG_CAPACITY)
    }
}

impl ErrorLog {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            tx,
        }
    }

    /// Record a failure.
    pub fn record(&self, error: &dyn Display, context: &str, operation: &str, recovered: bool) {
        let backtrace = std::backtrace::Backtrace::capture();
        let stack_trace = match backtrace.status() {
            std::backtrace::BacktraceStatus::Captured => Some(backtrace.to_string()),
            _ => None,
        };

        let record = ErrorRecord {
            timestamp: Utc::now(),
            error: error.to_string(),
            context: context.to_owned(),
            operation: operation.to_owned(),
            recovered,
            stack_trace,
        };

        {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(record.clone());
        }

        // No subscribers is fine.
        let _ = self.tx.send(record);
    }

    /// Copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<ErrorRecord> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Live stream of new records.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorRecord> {
        self.tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

static GLOBAL: OnceLock<ErrorLog> = OnceLock::new();

/// The process-wide error log.
pub fn global() -> &'static ErrorLog {
    GLOBAL.get_or_init(ErrorLog::default)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
