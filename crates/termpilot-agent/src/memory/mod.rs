//! Tiered conversation memory.
//!
//! - short-term: the ordered message history of the session.
//! - working: files and functions currently in focus, keyed by path.
//! - long-term: decisions and summaries, persisted as JSON.
//!
//! [`MemoryManager`] owns all three tiers. Operations are synchronous;
//! the agent wraps the manager in a lock and persists the long-term tier
//! with [`persist::save_long_term`] after it changes.

pub mod manager;
pub mod persist;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::types::{Message, Role};

pub use manager::{KEEP_RECENT_ON_COMPRESS, MemoryManager, MIN_RELEVANCE, working_key};

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Short,
    Working,
    Long,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    Message,
    File,
    Function,
    Decision,
    Summary,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    /// Inclusive 1-based line range.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_range: Option<(u32, u32)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryItem {
    pub id: String,
    pub tier: MemoryTier,
    pub kind: MemoryKind,
    pub content: String,
    #[serde(default)]
    pub metadata: MemoryMetadata,
    /// In `[0, 1]`.
    pub relevance: f64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    /// The full message for short-term items, tool calls included.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Message>,
}

impl MemoryItem {
    pub fn new(tier: MemoryTier, kind: MemoryKind, content: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            tier,
            kind,
            content: content.into(),
            metadata: MemoryMetadata::default(),
            relevance: 1.0,
            created_at: now,
            accessed_at: now,
            message: None,
        }
    }

    /// Short-term item wrapping a conversation message.
    pub fn from_message(message: Message) -> Self {
        let mut item = Self::new(MemoryTier::Short, MemoryKind::Message, message.content.clone());
        item.metadata.role = Some(message.role);
        item.message = Some(message);
        item
    }

    pub fn with_relevance(mut self, relevance: f64) -> Self {
        self.relevance = relevance.clamp(0.0, 1.0);
        self
    }

    pub fn role(&self) -> Option<Role> {
        self.message
            .as_ref()
            .map(|m| m.role)
            .or(self.metadata.role)
    }

    pub fn is_system(&self) -> bool {
        self.role() == Some(Role::System)
    }

    /// Message view of a short-term item.
    pub fn to_message(&self) -> Message {
        match &self.message {
            Some(message) => message.clone(),
            None => match self.metadata.role.unwrap_or(Role::User) {
                Role::System => Message::system(self.content.clone()),
                Role::Assistant => Message::assistant(self.content.clone()),
                _ => Message::user(self.content.clone()),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// The `memory` section of the configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub max_short_term_items: usize,
    pub max_working_items: usize,
    pub max_long_term_items: usize,
    /// Short-term length above which compression is signaled.
    pub compression_trigger: usize,
    /// Long-term JSON file; memory-only when absent.
    pub storage_path: Option<PathBuf>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_short_term_items: 100,
            max_working_items: 30,
            max_long_term_items: 200,
            compression_trigger: 60,
            storage_path: None,
        }
    }
}
