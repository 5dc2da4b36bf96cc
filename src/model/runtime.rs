use super::task::{Exclusivity, TaskEntry};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A host runtime as published in the shared `runtimes` map by the host registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct RuntimeInfo {
    pub id: String,
    /// Current exclusivity of the runtime, set by the task it accepted.
    #[serde(default)]
    pub exclusivity: Exclusivity,
    /// Context id (context-exclusive) or task id (exclusive) the runtime is reserved for.
    #[serde(default)]
    pub exclusive_id: Option<String>,
    #[serde(default)]
    pub task_count: u32,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

impl RuntimeInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_exclusivity(mut self, exclusivity: Exclusivity, exclusive_id: Option<String>) -> Self {
        self.exclusivity = exclusivity;
        self.exclusive_id = exclusive_id;
        self
    }

    pub fn with_task_count(mut self, task_count: u32) -> Self {
        self.task_count = task_count;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn is_idle(&self) -> bool {
        self.task_count == 0
    }

    /// Whether the runtime's current exclusivity leaves room for `task`.
    ///
    /// - non-exclusive runtimes take any non-exclusive task, and an exclusive one only when idle
    /// - context-exclusive runtimes take only tasks of the context they are reserved for
    /// - exclusive runtimes take nothing
    pub fn accepts(&self, task: &TaskEntry) -> bool {
        match self.exclusivity {
            Exclusivity::NonExclusive => {
                task.descriptor.exclusivity == Exclusivity::NonExclusive || self.is_idle()
            }
            Exclusivity::ContextExclusive => {
                self.exclusive_id.as_deref() == Some(task.task_context_id.as_str())
            }
            Exclusivity::Exclusive => false,
        }
    }
}
