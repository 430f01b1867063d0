//! `velu-registry` — the task handler registry.
//!
//! Handlers are plain functions from a [`TaskContext`] to a JSON result.
//! They receive everything they need through the context; nothing in here
//! reads request state or talks to the store, and the HTTP gateway never
//! links this crate — it only sees the set of registered names.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use serde_json::{Map, Value};
use thiserror::Error;

mod builtin;

/// Everything a handler may use: the job payload and, when the worker set
/// one up, the job's private workspace directory.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub payload: Map<String, Value>,
    pub workspace: Option<PathBuf>,
}

impl TaskContext {
    pub fn new(payload: Map<String, Value>) -> Self {
        Self {
            payload,
            workspace: None,
        }
    }

    pub fn with_workspace(mut self, workspace: PathBuf) -> Self {
        self.workspace = Some(workspace);
        self
    }

    /// Convenience string accessor for payload fields.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Task handler function type.
pub type TaskHandler = Box<dyn Fn(&TaskContext) -> Result<Value, TaskError> + Send + Sync>;

/// Name → handler table.
pub struct TaskRegistry {
    handlers: BTreeMap<String, TaskHandler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    /// Registry with every built-in handler installed.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::install(&mut registry);
        registry
    }

    /// Register a handler for a task name. Re-registering replaces.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&TaskContext) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<&TaskHandler> {
        self.handlers.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, in sorted order.
    pub fn names(&self) -> BTreeSet<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl core::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("names", &self.names())
            .finish()
    }
}
