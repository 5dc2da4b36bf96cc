use super::now_ms;
use super::query::RuntimeQuery;
use crate::store::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a task.
///
/// `Submitted -> Waiting -> Scheduled -> {Finished | Aborted}`. `Waiting` is only entered while the
/// task's dependency is unresolved.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Submitted,
    Waiting,
    Scheduled,
    Finished,
    Aborted,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted)
    }

    /// States from which the scheduling action may move a task to `Scheduled`.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Submitted | Self::Waiting)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Submitted => "SUBMITTED",
            Self::Waiting => "WAITING",
            Self::Scheduled => "SCHEDULED",
            Self::Finished => "FINISHED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SUBMITTED" => Ok(Self::Submitted),
            "WAITING" => Ok(Self::Waiting),
            "SCHEDULED" => Ok(Self::Scheduled),
            "FINISHED" => Ok(Self::Finished),
            "ABORTED" => Ok(Self::Aborted),
            other => Err(format!("unknown task state '{other}'")),
        }
    }
}

/// How much of a host runtime a task wants for itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Exclusivity {
    /// Shares the runtime with any other non-exclusive task.
    #[default]
    NonExclusive,
    /// Shares the runtime only with tasks of the same context.
    ContextExclusive,
    /// Runs alone.
    Exclusive,
}

impl fmt::Display for Exclusivity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NonExclusive => "NON_EXCLUSIVE",
            Self::ContextExclusive => "CONTEXT_EXCLUSIVE",
            Self::Exclusive => "EXCLUSIVE",
        };
        f.write_str(name)
    }
}

/// The work a task performs, as far as the scheduler cares.
///
/// `payload` is opaque here and only interpreted by the runtime executing the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskDescriptor {
    pub name: String,
    #[serde(default)]
    pub exclusivity: Exclusivity,
    /// Constraint on the runtimes allowed to run the task.
    #[serde(default)]
    pub host_runtimes: Option<RuntimeQuery>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_exclusivity(mut self, exclusivity: Exclusivity) -> Self {
        self.exclusivity = exclusivity;
        self
    }

    pub fn with_query(mut self, query: RuntimeQuery) -> Self {
        self.host_runtimes = Some(query);
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// One entry of a task's state history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateChange {
    pub state: TaskState,
    pub reason: String,
    pub timestamp: u64,
}

/// A task as stored in the shared `tasks` map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskEntry {
    pub id: String,
    pub descriptor: TaskDescriptor,
    pub state: TaskState,
    /// Node currently responsible for driving the task.
    pub owner_id: Option<NodeId>,
    /// Runtime executing the task, once scheduled.
    pub runtime_id: Option<String>,
    pub task_context_id: String,
    /// Id of a task in the same context that must finish first.
    pub task_dependency: Option<String>,
    pub benchmark_id: Option<String>,
    pub state_log: Vec<StateChange>,
}

impl TaskEntry {
    pub fn new(descriptor: TaskDescriptor, task_context_id: impl Into<String>) -> Self {
        let mut entry = Self {
            id: uuid::Uuid::new_v4().to_string(),
            descriptor,
            state: TaskState::Submitted,
            owner_id: None,
            runtime_id: None,
            task_context_id: task_context_id.into(),
            task_dependency: None,
            benchmark_id: None,
            state_log: Vec::new(),
        };
        entry.state_log.push(StateChange {
            state: TaskState::Submitted,
            reason: "submitted".to_string(),
            timestamp: now_ms(),
        });
        entry
    }

    pub fn with_dependency(mut self, task_id: impl Into<String>) -> Self {
        self.task_dependency = Some(task_id.into());
        self
    }

    pub fn with_benchmark(mut self, benchmark_id: impl Into<String>) -> Self {
        self.benchmark_id = Some(benchmark_id.into());
        self
    }

    /// Moves the task to `state`, recording the change.
    pub fn set_state(&mut self, state: TaskState, reason: impl Into<String>) {
        self.state = state;
        self.state_log.push(StateChange {
            state,
            reason: reason.into(),
            timestamp: now_ms(),
        });
    }

    pub fn is_owned_by(&self, node: &NodeId) -> bool {
        self.owner_id.as_ref() == Some(node)
    }

    /// Reason recorded with the most recent state change.
    pub fn last_reason(&self) -> Option<&str> {
        self.state_log.last().map(|change| change.reason.as_str())
    }
}
