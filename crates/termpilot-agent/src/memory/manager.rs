//! The three-tier memory manager.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};

use crate::llm::types::{Message, Role};
use crate::memory::{MemoryConfig, MemoryItem, MemoryKind, MemoryTier};

/// Short-term items left untouched by compression.
pub const KEEP_RECENT_ON_COMPRESS: usize = 5;

/// Working items whose relevance decays below this are dropped.
pub const MIN_RELEVANCE: f64 = 0.1;

/// Working-memory key: the path, or `path::function`.
pub fn working_key(path: &str, function: Option<&str>) -> String {
    match function {
        Some(f) if !f.is_empty() => format!("{path}::{f}"),
        _ => path.to_owned(),
    }
}

#[derive(Debug, Clone)]
pub struct MemoryManager {
    config: MemoryConfig,
    short: VecDeque<MemoryItem>,
    working: HashMap<String, MemoryItem>,
    long: VecDeque<MemoryItem>,
    /// Ids handed out by the last `get_items_to_compress`.
    pending_compression: Vec<String>,
    /// Bumped whenever working or long-term memory changes.
    revision: u64,
    /// When decay was last applied; decay never counts the same hour twice.
    last_aged: Option<DateTime<Utc>>,
}

impl MemoryManager {
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            config,
            short: VecDeque::new(),
            working: HashMap::new(),
            long: VecDeque::new(),
            pending_compression: Vec::new(),
            revision: 0,
            last_aged: None,
        }
    }

    /// Manager seeded with a previously persisted long-term tier.
    pub fn with_long_term(config: MemoryConfig, items: Vec<MemoryItem>) -> Self {
        let mut manager = Self::new(config);
        for item in items {
            manager.push_long(item);
        }
        manager.revision = 0;
        manager
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Counter that changes whenever the assembled prompt prefix would.
    pub fn prefix_revision(&self) -> u64 {
        self.revision
    }

    fn bump(&mut self) {
        self.revision = self.revision.wrapping_add(1);
    }

    // -- short-term --------------------------------------------------------

    /// Append a message, dropping the oldest non-system items beyond
    /// capacity. Returns the new item's id.
    pub fn add_message(&mut self, message: Message) -> String {
        let item = MemoryItem::from_message(message);
        let id = item.id.clone();
        self.short.push_back(item);
        while self.short.len() > self.config.max_short_term_items.max(1) {
            match self.short.iter().position(|i| !i.is_system()) {
                Some(idx) => {
                    self.short.remove(idx);
                }
                None => break,
            }
        }
        id
    }

    pub fn short_term(&self) -> impl Iterator<Item = &MemoryItem> {
        self.short.iter()
    }

    pub fn short_len(&self) -> usize {
        self.short.len()
    }

    pub fn last_short(&self) -> Option<&MemoryItem> {
        self.short.back()
    }

    /// Contents of system-role short-term items, oldest first.
    pub fn pinned_notes(&self) -> Vec<&str> {
        self.short
            .iter()
            .filter(|i| i.is_system())
            .map(|i| i.content.as_str())
            .collect()
    }

    /// The last `k` non-system messages.
    ///
    /// Tool messages at the start of the window are dropped since their
    /// assistant message fell outside it.
    pub fn recent_messages(&self, k: usize) -> Vec<Message> {
        let conversation: Vec<&MemoryItem> = self.short.iter().filter(|i| !i.is_system()).collect();
        let start = conversation.len().saturating_sub(k);
        conversation[start..]
            .iter()
            .map(|i| i.to_message())
            .skip_while(|m| m.role == Role::Tool)
            .collect()
    }

    /// Remove the oldest `fraction` of non-system items, rounding up.
    /// System items are never removed. Returns the number removed.
    pub fn trim_oldest(&mut self, fraction: f64) -> usize {
        let fraction = fraction.clamp(0.0, 1.0);
        let candidates = self.short.iter().filter(|i| !i.is_system()).count();
        let target = (candidates as f64 * fraction).ceil() as usize;
        if target == 0 {
            return 0;
        }
        let mut removed = 0;
        self.short.retain(|item| {
            if removed < target && !item.is_system() {
                removed += 1;
                false
            } else {
                true
            }
        });
        tracing::debug!(removed, remaining = self.short.len(), "trimmed short-term memory");
        removed
    }

    /// Remove the item `id` and everything after it. Returns the number
    /// removed; an unknown id removes nothing.
    pub fn truncate_short_from(&mut self, id: &str) -> usize {
        let Some(idx) = self.short.iter().position(|i| i.id == id) else {
            return 0;
        };
        let removed = self.short.len() - idx;
        self.short.truncate(idx);
        self.pending_compression.clear();
        removed
    }

    pub fn clear_short_term(&mut self) {
        self.short.clear();
        self.pending_compression.clear();
    }

    // -- working -----------------------------------------------------------

    /// Insert or overwrite a file in working memory.
    pub fn add_file(&mut self, path: &str, content: impl Into<String>, relevance: f64) -> String {
        let mut item = MemoryItem::new(MemoryTier::Working, MemoryKind::File, content).with_relevance(relevance);
        item.metadata.file_path = Some(path.to_owned());
        self.insert_working(working_key(path, None), item)
    }

    /// Insert or overwrite a single function of a file.
    pub fn add_function(
        &mut self,
        path: &str,
        function: &str,
        content: impl Into<String>,
        line_range: Option<(u32, u32)>,
        relevance: f64,
    ) -> String {
        let mut item =
            MemoryItem::new(MemoryTier::Working, MemoryKind::Function, content).with_relevance(relevance);
        item.metadata.file_path = Some(path.to_owned());
        item.metadata.function_name = Some(function.to_owned());
        item.metadata.line_range = line_range;
        self.insert_working(working_key(path, Some(function)), item)
    }

    fn insert_working(&mut self, key: String, item: MemoryItem) -> String {
        self.working.insert(key.clone(), item);
        while self.working.len() > self.config.max_working_items.max(1) {
            let victim = self
                .working
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.relevance
                        .total_cmp(&b.relevance)
                        .then(a.accessed_at.cmp(&b.accessed_at))
                })
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    tracing::debug!(key = %k, "evicted working memory item");
                    self.working.remove(&k);
                }
                None => break,
            }
        }
        self.bump();
        key
    }

    pub fn get_working(&self, key: &str) -> Option<&MemoryItem> {
        self.working.get(key)
    }

    /// Mark a working item as accessed now.
    pub fn touch(&mut self, key: &str) -> bool {
        match self.working.get_mut(key) {
            Some(item) => {
                item.accessed_at = Utc::now();
                true
            }
            None => false,
        }
    }

    pub fn remove_working(&mut self, key: &str) -> bool {
        let removed = self.working.remove(key).is_some();
        if removed {
            self.bump();
        }
        removed
    }

    /// Working items ordered by relevance (highest first), then key.
    pub fn working_items(&self) -> Vec<(&str, &MemoryItem)> {
        let mut items: Vec<(&str, &MemoryItem)> = self.working.iter().map(|(k, v)| (k.as_str(), v)).collect();
        items.sort_by(|(ka, a), (kb, b)| b.relevance.total_cmp(&a.relevance).then(ka.cmp(kb)));
        items
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }

    /// Decay relevance by `decay` per hour since last access and drop
    /// items that fall below [`MIN_RELEVANCE`]. Returns the number dropped.
    pub fn age_working(&mut self, decay: f64) -> usize {
        self.age_working_at(decay, Utc::now())
    }

    pub fn age_working_at(&mut self, decay: f64, now: DateTime<Utc>) -> usize {
        let since = self.last_aged.replace(now);
        for item in self.working.values_mut() {
            let from = match since {
                Some(t) if t > item.accessed_at => t,
                _ => item.accessed_at,
            };
            let hours = (now - from).num_seconds().max(0) as f64 / 3600.0;
            item.relevance = (item.relevance - decay * hours).max(0.0);
        }
        let before = self.working.len();
        self.working.retain(|_, item| item.relevance >= MIN_RELEVANCE);
        let dropped = before - self.working.len();
        if dropped > 0 {
            tracing::debug!(dropped, "aged out working memory items");
            self.bump();
        }
        dropped
    }

    // -- long-term ---------------------------------------------------------

    pub fn add_decision(&mut self, content: impl Into<String>) -> String {
        self.add_long_term(MemoryItem::new(MemoryTier::Long, MemoryKind::Decision, content))
    }

    pub fn add_long_term(&mut self, mut item: MemoryItem) -> String {
        item.tier = MemoryTier::Long;
        let id = item.id.clone();
        self.push_long(item);
        self.bump();
        id
    }

    fn push_long(&mut self, item: MemoryItem) {
        self.long.push_back(item);
        while self.long.len() > self.config.max_long_term_items.max(1) {
            self.long.pop_front();
        }
    }

    pub fn long_term(&self) -> impl Iterator<Item = &MemoryItem> {
        self.long.iter()
    }

    pub fn long_term_snapshot(&self) -> Vec<MemoryItem> {
        self.long.iter().cloned().collect()
    }

    pub fn long_len(&self) -> usize {
        self.long.len()
    }

    // -- compression -------------------------------------------------------

    pub fn needs_compression(&self) -> bool {
        self.short.len() > self.config.compression_trigger
    }

    /// Items to summarize, or empty when short-term is below the trigger.
    ///
    /// Returns the oldest non-system items, leaving the last
    /// [`KEEP_RECENT_ON_COMPRESS`] in place.
    pub fn get_items_to_compress(&mut self) -> Vec<MemoryItem> {
        if !self.needs_compression() {
            self.pending_compression.clear();
            return Vec::new();
        }
        let items = self.compressible();
        self.pending_compression = items.iter().map(|i| i.id.clone()).collect();
        items
    }

    fn compressible(&self) -> Vec<MemoryItem> {
        let cut = self.short.len().saturating_sub(KEEP_RECENT_ON_COMPRESS);
        self.short
            .iter()
            .take(cut)
            .filter(|i| !i.is_system())
            .cloned()
            .collect()
    }

    /// Replace the signaled items with `summary` in long-term memory.
    ///
    /// Returns the new summary item, or `None` when there was nothing to
    /// compress.
    pub fn compress_items(&mut self, summary: &str) -> Option<MemoryItem> {
        let ids = if self.pending_compression.is_empty() {
            self.compressible().into_iter().map(|i| i.id).collect()
        } else {
            std::mem::take(&mut self.pending_compression)
        };
        self.compress_ids(&ids, summary)
    }

    /// Replace exactly the items in `ids` with `summary`. Any signaled set
    /// from an earlier [`get_items_to_compress`](Self::get_items_to_compress)
    /// is dropped.
    pub fn compress_ids(&mut self, ids: &[String], summary: &str) -> Option<MemoryItem> {
        self.pending_compression.clear();
        if ids.is_empty() {
            return None;
        }

        let before = self.short.len();
        self.short.retain(|item| !ids.contains(&item.id));
        let removed = before - self.short.len();

        let mut item = MemoryItem::new(MemoryTier::Long, MemoryKind::Summary, summary.trim());
        item.metadata.tags.push("compression".into());
        self.add_long_term(item.clone());
        tracing::info!(removed, long_term = self.long.len(), "compressed short-term memory");
        Some(item)
    }

    /// Forget the signaled set after a failed summarization.
    pub fn abandon_compression(&mut self) {
        self.pending_compression.clear();
    }

    // -- lifecycle ---------------------------------------------------------

    /// Forget the conversation and working set. Long-term memory stays.
    pub fn reset(&mut self) {
        self.short.clear();
        self.working.clear();
        self.pending_compression.clear();
        self.bump();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
