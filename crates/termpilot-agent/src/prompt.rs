//! Prompt assembly.
//!
//! The system message is built in a fixed order: identity, personality,
//! expertise, project rules, current tasks, long-term summaries, working
//! context. Recent short-term messages follow it. The context cache
//! fingerprints the system message, so changing this order changes every
//! fingerprint.

use std::hash::{DefaultHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::llm::types::{Message, Role};
use crate::memory::{MemoryKind, MemoryManager};

pub const DEFAULT_IDENTITY: &str = "You are termpilot, a coding assistant working inside the user's terminal. \
You can read and change files and run commands through the tools you are given. \
Prefer small, verifiable steps and report what you changed.";

/// Long-term items included in the prompt.
const MAX_LONG_TERM_IN_PROMPT: usize = 20;

/// Per-item cap for working-context content.
const MAX_WORKING_ITEM_CHARS: usize = 4000;

/// Static parts of the system prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptProfile {
    pub identity: String,
    pub personality: Option<String>,
    pub expertise: Option<String>,
    pub rules: Vec<String>,
    pub tasks: Vec<String>,
}

impl Default for PromptProfile {
    fn default() -> Self {
        Self {
            identity: DEFAULT_IDENTITY.to_owned(),
            personality: None,
            expertise: None,
            rules: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl PromptProfile {
    /// Same profile with a different identity, used for role agents.
    pub fn with_identity(&self, identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            ..self.clone()
        }
    }
}

/// Build the system message text.
pub fn build_system_prompt(profile: &PromptProfile, memory: &MemoryManager) -> String {
    let mut sections: Vec<String> = vec![profile.identity.trim().to_owned()];

    if let Some(p) = profile.personality.as_deref().filter(|p| !p.trim().is_empty()) {
        sections.push(format!("## Personality\n{}", p.trim()));
    }
    if let Some(e) = profile.expertise.as_deref().filter(|e| !e.trim().is_empty()) {
        sections.push(format!("## Expertise\n{}", e.trim()));
    }
    if !profile.rules.is_empty() {
        sections.push(format!("## Project rules\n{}", bullet_list(&profile.rules)));
    }
    if !profile.tasks.is_empty() {
        sections.push(format!("## Current tasks\n{}", bullet_list(&profile.tasks)));
    }

    let long: Vec<String> = memory
        .long_term()
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .take(MAX_LONG_TERM_IN_PROMPT)
        .rev()
        .map(|item| {
            let label = match item.kind {
                MemoryKind::Decision => "decision",
                _ => "summary",
            };
            format!("- ({label}) {}", item.content.trim())
        })
        .collect();
    if !long.is_empty() {
        sections.push(format!("## Earlier context\n{}", long.join("\n")));
    }

    let working = memory.working_items();
    if !working.is_empty() {
        let mut block = String::from("## Working context");
        for (key, item) in working {
            let mut heading = format!("\n### {key}");
            if let Some((start, end)) = item.metadata.line_range {
                heading.push_str(&format!(" (lines {start}-{end})"));
            }
            block.push_str(&heading);
            block.push_str("\n```\n");
            block.push_str(&clip(&item.content, MAX_WORKING_ITEM_CHARS));
            block.push_str("\n```");
        }
        sections.push(block);
    }

    let notes = memory.pinned_notes();
    if !notes.is_empty() {
        sections.push(format!(
            "## Notes\n{}",
            notes.iter().map(|n| format!("- {}", n.trim())).collect::<Vec<_>>().join("\n")
        ));
    }

    sections.join("\n\n")
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|i| format!("- {}", i.trim()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}\n... [truncated]")
}

/// Stable fingerprint of a system prompt.
pub fn fingerprint(system_prompt: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    system_prompt.hash(&mut hasher);
    hasher.finish()
}

/// Messages for one request.
///
/// With `elide` the system message and everything before the latest user
/// message are left out.
pub fn assemble(system_prompt: &str, memory: &MemoryManager, window: usize, elide: bool) -> Vec<Message> {
    let history = memory.recent_messages(window);
    if elide {
        let start = history.iter().rposition(|m| m.role == Role::User).unwrap_or(0);
        return history[start..].to_vec();
    }
    let mut messages = Vec::with_capacity(history.len() + 1);
    messages.push(Message::system(system_prompt));
    messages.extend(history);
    messages
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
