use super::task::TaskDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Id of the lingering context holding every benchmark generator task.
pub const GENERATOR_CONTEXT_ID: &str = "benchmark-generators";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContextState {
    Waiting,
    Running,
    Finished,
}

impl fmt::Display for ContextState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// A reusable task descriptor that context tasks can refer to by name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskTemplate {
    pub name: String,
    pub descriptor: TaskDescriptor,
}

/// A task declared by a context: either inline or through a template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ContextTask {
    pub name: String,
    #[serde(default)]
    pub descriptor: Option<TaskDescriptor>,
    #[serde(default)]
    pub template: Option<String>,
    /// Name of a sibling task that must finish first.
    #[serde(default)]
    pub run_after_task: Option<String>,
    /// Overrides applied on top of the context and descriptor properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ContextTask {
    pub fn inline(name: impl Into<String>, descriptor: TaskDescriptor) -> Self {
        Self {
            name: name.into(),
            descriptor: Some(descriptor),
            ..Default::default()
        }
    }

    pub fn from_template(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: Some(template.into()),
            ..Default::default()
        }
    }

    pub fn run_after(mut self, task_name: impl Into<String>) -> Self {
        self.run_after_task = Some(task_name.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Declaration of a group of tasks that run together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskContextDescriptor {
    pub name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub templates: Vec<TaskTemplate>,
    #[serde(default)]
    pub tasks: Vec<ContextTask>,
}

impl TaskContextDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: ContextTask) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_template(mut self, name: impl Into<String>, descriptor: TaskDescriptor) -> Self {
        self.templates.push(TaskTemplate {
            name: name.into(),
            descriptor,
        });
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn template(&self, name: &str) -> Option<&TaskTemplate> {
        self.templates.iter().find(|template| template.name == name)
    }
}

/// A task context as stored in the shared `contexts` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskContextEntry {
    pub id: String,
    pub descriptor: TaskContextDescriptor,
    pub state: ContextState,
    pub contained_task: BTreeSet<String>,
    pub benchmark_id: Option<String>,
    /// Exempt from TTL eviction.
    pub lingering: bool,
}

impl TaskContextEntry {
    pub fn new(descriptor: TaskContextDescriptor, benchmark_id: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            descriptor,
            state: ContextState::Waiting,
            contained_task: BTreeSet::new(),
            benchmark_id,
            lingering: false,
        }
    }

    /// The always-present context tracking benchmark generator tasks.
    pub fn generator() -> Self {
        Self {
            id: GENERATOR_CONTEXT_ID.to_string(),
            descriptor: TaskContextDescriptor::new("Benchmark generators"),
            state: ContextState::Running,
            contained_task: BTreeSet::new(),
            benchmark_id: None,
            lingering: true,
        }
    }
}

/// Prefix shared by every ephemeral cluster object belonging to a context.
pub fn context_object_prefix(context_id: &str) -> String {
    format!("{context_id}#")
}
