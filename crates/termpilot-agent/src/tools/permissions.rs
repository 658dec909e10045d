//! Permission gate consulted before every tool dispatch.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tool permissions from the `permissions` config section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionPolicy {
    /// Command prefixes the shell tool may run. Empty allows everything.
    pub allowed_commands: Vec<String>,
    /// Tools the model may call. Empty allows every registered tool.
    pub allowed_tools: Vec<String>,
    /// Tools that always need approval.
    pub sensitive_tools: Vec<String>,
    pub auto_approve_non_sensitive: bool,
    pub require_approval_for_all: bool,
    pub enable_audit_log: bool,
    pub audit_log_path: Option<String>,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            allowed_commands: Vec::new(),
            allowed_tools: Vec::new(),
            sensitive_tools: Vec::new(),
            auto_approve_non_sensitive: true,
            require_approval_for_all: false,
            enable_audit_log: false,
            audit_log_path: None,
        }
    }
}

/// What the gate decided for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Allow,
    NeedsApproval,
    Deny(String),
}

impl PermissionPolicy {
    /// Decide whether `tool` may run. `registered_sensitive` comes from
    /// the tool's own registration.
    pub fn check(&self, tool: &str, registered_sensitive: bool) -> Gate {
        if !self.allowed_tools.is_empty() && !self.allowed_tools.iter().any(|t| t == tool) {
            return Gate::Deny(format!("tool not allowed: {tool}"));
        }
        let sensitive = registered_sensitive || self.sensitive_tools.iter().any(|t| t == tool);
        if self.require_approval_for_all || sensitive || !self.auto_approve_non_sensitive {
            Gate::NeedsApproval
        } else {
            Gate::Allow
        }
    }

    /// Whether a shell command line starts with an allowed prefix.
    pub fn command_allowed(&self, command: &str) -> bool {
        let command = command.trim_start();
        self.allowed_commands.is_empty()
            || self.allowed_commands.iter().any(|prefix| {
                command == prefix.as_str()
                    || command
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with(char::is_whitespace))
            })
    }
}

/// Asked before a gated tool runs.
#[async_trait]
pub trait Approver: Send + Sync {
    async fn approve(&self, tool: &str, arguments: &Value) -> bool;
}

/// Approves everything. Used by non-interactive callers that have already
/// scoped `allowed_tools`.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl Approver for AutoApprove {
    async fn approve(&self, _tool: &str, _arguments: &Value) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DenyAll;

#[async_trait]
impl Approver for DenyAll {
    async fn approve(&self, tool: &str, _arguments: &Value) -> bool {
        tracing::debug!(tool, "approval denied");
        false
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
