//! Cluster Topic Protocol
//!
//! Messages exchanged over the shared topics with host runtimes and other collaborators.
//! Runtimes listen on `GLOBAL_TOPIC` and pick the messages addressed to their id.
//!
//! Constants name the topics and the shared maps used by every node.

use crate::model::ContextState;
use crate::store::NodeId;
use serde::{Deserialize, Serialize};

pub const GLOBAL_TOPIC: &str = "global";
pub const CONTEXT_STATE_TOPIC: &str = "context-state";

pub const TASKS_MAP: &str = "tasks";
pub const CONTEXTS_MAP: &str = "contexts";
pub const BENCHMARKS_MAP: &str = "benchmarks";
pub const RUNTIMES_MAP: &str = "runtimes";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    /// Asks a runtime to start a task it was just scheduled on.
    RunTask {
        sender_id: NodeId,
        receiver_id: String,
        task_id: String,
    },
    /// Asks a runtime to kill a running task.
    KillTask {
        receiver_id: String,
        task_id: String,
        reason: String,
    },
    /// Tells the runtime (if any) that the scheduler aborted a task.
    AbortTask {
        receiver_id: Option<String>,
        task_id: String,
        reason: String,
    },
    ContextStateChanged {
        context_id: String,
        state: ContextState,
    },
}

/// Name of the cluster counter tracking how many scan passes a scheduled task has left to be
/// acknowledged by its runtime.
pub fn lease_counter_name(task_id: &str) -> String {
    format!("{task_id}#lease")
}
