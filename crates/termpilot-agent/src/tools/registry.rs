//! Thread-safe tool registry.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::{AgentError, Result};
use crate::llm::types::ToolDefinition;
use crate::tools::schema::ToolSchema;
use crate::tools::{ToolFilter, ToolHandler};

/// Everything needed to register a tool.
#[derive(Clone)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub schema: ToolSchema,
    pub handler: Option<Arc<dyn ToolHandler>>,
    /// Always routed through the approver.
    pub sensitive: bool,
    /// Safe to offer to research-only roles.
    pub read_only: bool,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: ToolSchema::default(),
            handler: None,
            sensitive: false,
            read_only: false,
        }
    }

    pub fn schema(mut self, schema: ToolSchema) -> Self {
        self.schema = schema;
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ToolHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }
}

impl std::fmt::Debug for ToolSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolSpec")
            .field("name", &self.name)
            .field("sensitive", &self.sensitive)
            .field("read_only", &self.read_only)
            .field("has_handler", &self.handler.is_some())
            .finish()
    }
}

/// A registered tool; the handler is guaranteed present.
#[derive(Clone)]
pub struct RegisteredTool {
    pub name: String,
    pub description: String,
    pub schema: ToolSchema,
    pub handler: Arc<dyn ToolHandler>,
    pub sensitive: bool,
    pub read_only: bool,
}

impl RegisteredTool {
    pub fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.schema.to_json_schema(),
        }
    }
}

/// Name → tool map behind a reader-writer lock.
///
/// Lookups clone an `Arc` out so the lock is never held across a handler
/// call.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<RegisteredTool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, spec: ToolSpec) -> Result<()> {
        let name = spec.name.trim().to_owned();
        if name.is_empty() {
            return Err(AgentError::ToolRegistration {
                reason: "tool name is empty".into(),
            });
        }
        let Some(handler) = spec.handler else {
            return Err(AgentError::ToolRegistration {
                reason: format!("tool `{name}` has no handler"),
            });
        };

        let mut tools = self.tools.write().unwrap_or_else(PoisonError::into_inner);
        if tools.contains_key(&name) {
            return Err(AgentError::ToolRegistration {
                reason: format!("tool `{name}` is already registered"),
            });
        }
        tracing::debug!(tool = %name, sensitive = spec.sensitive, "tool registered");
        tools.insert(
            name.clone(),
            Arc::new(RegisteredTool {
                name,
                description: spec.description,
                schema: spec.schema,
                handler,
                sensitive: spec.sensitive,
                read_only: spec.read_only,
            }),
        );
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Snapshot of every registered tool, ordered by name.
    pub fn list(&self) -> Vec<Arc<RegisteredTool>> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Definitions for the model, restricted by `filter`.
    pub fn export(&self, filter: ToolFilter) -> Vec<ToolDefinition> {
        if filter == ToolFilter::None {
            return Vec::new();
        }
        self.list()
            .iter()
            .filter(|t| filter.permits(t.read_only))
            .map(|t| t.definition())
            .collect()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
