//! Tool descriptors and the registry the dispatcher resolves against.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::error::CallError;

/// Where a tool executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Runs inside the bridge, no round trip.
    Local,
    /// Forwarded to the browser agent.
    Remote,
}

/// Immutable description of a tool, as listed to callers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    #[serde(skip)]
    pub capability: Capability,
}

impl ToolDescriptor {
    /// Names listed in the schema's `required` array but absent from `arguments`.
    #[must_use]
    pub fn missing_required(&self, arguments: &Value) -> Vec<String> {
        let Some(required) = self.input_schema.get("required").and_then(Value::as_array) else {
            return Vec::new();
        };
        required
            .iter()
            .filter_map(Value::as_str)
            .filter(|key| arguments.get(*key).is_none_or(Value::is_null))
            .map(str::to_string)
            .collect()
    }
}

/// Handler for a tool that runs inside the bridge.
#[async_trait]
pub trait LocalHandler: Send + Sync {
    /// Execute with the caller's arguments.
    async fn call(&self, arguments: Value) -> Result<Value, CallError>;
}

/// A registered tool: its descriptor plus, for local tools, the handler.
#[derive(Clone)]
pub struct Tool {
    descriptor: ToolDescriptor,
    handler: Option<Arc<dyn LocalHandler>>,
}

impl Tool {
    /// A tool forwarded to the agent.
    #[must_use]
    pub fn remote(name: impl Into<String>, description: impl Into<String>, input_schema: Value) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                input_schema,
                capability: Capability::Remote,
            },
            handler: None,
        }
    }

    /// A tool executed by `handler` inside the bridge.
    #[must_use]
    pub fn local(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: Arc<dyn LocalHandler>,
    ) -> Self {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                input_schema,
                capability: Capability::Local,
            },
            handler: Some(handler),
        }
    }

    #[must_use]
    pub const fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    /// The local handler, `None` for remote tools.
    #[must_use]
    pub fn handler(&self) -> Option<&Arc<dyn LocalHandler>> {
        self.handler.as_ref()
    }
}

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tool already registered: {0}")]
    Duplicate(String),
}

/// Static name → tool lookup, listed in registration order.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool.
    ///
    /// # Errors
    /// Returns error if a tool with the same name exists.
    pub fn register(&mut self, tool: Tool) -> Result<(), RegistryError> {
        if self.index.contains_key(tool.name()) {
            return Err(RegistryError::Duplicate(tool.name().to_string()));
        }
        self.index.insert(tool.name().to_string(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ToolDescriptor> {
        self.tools.iter().map(Tool::descriptor)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
