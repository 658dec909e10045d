//! Tool execution audit trail.
//!
//! Every execution produces one [`AuditRecord`]. Records are kept in a
//! bounded in-memory ring and, when a path is configured, appended to a
//! JSON-lines file that is never truncated.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::tools::executor::ErrorCategory;

/// In-memory ring size.
pub const DEFAULT_AUDIT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub tool: String,
    /// SHA-256 of the canonical argument JSON, base64url.
    pub argument_digest: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_category: Option<ErrorCategory>,
}

impl AuditRecord {
    pub fn new(
        tool: &str,
        arguments: &Value,
        success: bool,
        duration_ms: u64,
        error_category: Option<ErrorCategory>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            tool: tool.to_owned(),
            argument_digest: argument_digest(arguments),
            success,
            duration_ms,
            error_category,
        }
    }
}

/// Digest of a tool's arguments; the raw values may hold secrets.
pub fn argument_digest(arguments: &Value) -> String {
    let canonical = arguments.to_string();
    let digest = ring::digest::digest(&ring::digest::SHA256, canonical.as_bytes());
    URL_SAFE_NO_PAD.encode(digest.as_ref())
}

pub struct AuditLog {
    capacity: usize,
    entries: Mutex<VecDeque<AuditRecord>>,
    file: Option<(PathBuf, tokio::sync::Mutex<tokio::fs::File>)>,
}

impl AuditLog {
    /// Memory-only log.
    pub fn in_memory() -> Self {
        Self {
            capacity: DEFAULT_AUDIT_CAPACITY,
            entries: Mutex::new(VecDeque::new()),
            file: None,
        }
    }

    /// Log that also appends to `path`, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        tracing::debug!(path = %path.display(), "audit log opened");
        Ok(Self {
            file: Some((path, tokio::sync::Mutex::new(file))),
            ..Self::in_memory()
        })
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|(p, _)| p.as_path())
    }

    /// Store `record` in the ring and append it to the file.
    ///
    /// File failures are logged, never returned; auditing must not fail a
    /// tool call.
    pub async fn record(&self, record: AuditRecord) {
        if let Some((path, file)) = &self.file {
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    let mut file = file.lock().await;
                    if let Err(e) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(path = %path.display(), error = %e, "failed to append audit record");
                    }
                }
                Err(e) => tracing::warn!(error = %e, "failed to serialize audit record"),
            }
        }

        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(record);
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn flush(&self) -> Result<()> {
        if let Some((_, file)) = &self.file {
            let mut file = file.lock().await;
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.len())
            .field("path", &self.path())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<AuditLog>> = OnceLock::new();

/// Install the process-wide audit log. Returns false if one was already
/// installed or first use already created a memory-only log.
pub fn install_global(log: Arc<AuditLog>) -> bool {
    GLOBAL.set(log).is_ok()
}

/// The process-wide audit log, memory-only unless installed earlier.
pub fn global() -> Arc<AuditLog> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(AuditLog::in_memory())))
}

/// Flush the global log's file on shutdown.
pub async fn flush_global() {
    if let Some(log) = GLOBAL.get() {
        if let Err(e) = log.flush().await {
            tracing::warn!(error = %e, "failed to flush audit log");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn digest_is_stable_and_hides_arguments() {
        let a = argument_digest(&json!({"password": "hunter2"}));
        assert_eq!(a, argument_digest(&json!({"password": "hunter2"})));
        assert_ne!(a, argument_digest(&json!({"password": "hunter3"})));
        assert!(!a.contains("hunter2"));
        assert_eq!(a.len(), 43);
    }

    #[tokio::test]
    async fn ring_keeps_most_recent() {
        let log = AuditLog::in_memory().with_capacity(2);
        for tool in ["a", "b", "c"] {
            log.record(AuditRecord::new(tool, &json!({}), true, 1, None)).await;
        }
        let tools: Vec<String> = log.recent().into_iter().map(|r| r.tool).collect();
        assert_eq!(tools, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn file_is_append_only_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit/tools.jsonl");

        let log = AuditLog::open(&path).await.unwrap();
        log.record(AuditRecord::new("echo", &json!({"text": "x"}), true, 3, None)).await;
        log.flush().await.unwrap();
        drop(log);

        let log = AuditLog::open(&path).await.unwrap().with_capacity(1);
        log.record(AuditRecord::new(
            "run_shell",
            &json!({}),
            false,
            9,
            Some(ErrorCategory::Execution),
        ))
        .await;
        log.record(AuditRecord::new("echo", &json!({}), true, 1, None)).await;
        log.flush().await.unwrap();
        assert_eq!(log.len(), 1);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1].tool, "run_shell");
        assert_eq!(lines[1].error_category, Some(ErrorCategory::Execution));
    }
}
