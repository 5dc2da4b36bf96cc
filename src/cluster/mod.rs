//! Cluster Access Layer
//!
//! `ClusterContext` is built once per node at startup and handed to every component that needs
//! the shared store. It bundles the node identity, the four shared maps, the topics, the cluster
//! objects, membership and configuration.
//!
//! ## Submodules
//! - **`tasks`**: task submission, kill, runtime acknowledgement and state reports.
//! - **`contexts`**: the task-context orchestrator (submit, materialize, cleanup, remove).
//! - **`benchmarks`**: benchmark submission and generator resubmission.
//! - **`protocol`**: topic messages and shared names.

pub mod benchmarks;
pub mod contexts;
pub mod protocol;
pub mod tasks;


pub use benchmarks::Benchmarks;
pub use contexts::TaskContexts;
pub use protocol::ClusterMessage;
pub use tasks::Tasks;

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::model::{BenchmarkEntry, RuntimeInfo, TaskContextEntry, TaskEntry};
use crate::store::memory::MemoryNode;
use crate::store::{ClusterObjects, EntryMap, Membership, NodeId, Topics};
use std::sync::Arc;

/// Store handles a node works with.
pub struct ClusterParts {
    /// Identity of the local node, compared against task owners.
    pub node_id: NodeId,
    /// Task entries keyed by task id.
    pub tasks: Arc<dyn EntryMap<TaskEntry>>,
    /// Task contexts keyed by context id.
    pub contexts: Arc<dyn EntryMap<TaskContextEntry>>,
    /// Benchmarks keyed by benchmark id.
    pub benchmarks: Arc<dyn EntryMap<BenchmarkEntry>>,
    /// Registered runtimes keyed by runtime id. Presence means the runtime is live.
    pub runtimes: Arc<dyn EntryMap<RuntimeInfo>>,
    /// Carries the global and context-state topics.
    pub topics: Arc<dyn Topics<ClusterMessage>>,
    /// Lease counters plus context latches and checkpoints.
    pub objects: Arc<dyn ClusterObjects>,
    pub membership: Arc<dyn Membership>,
}

#[derive(Clone)]
pub struct ClusterContext {
    parts: Arc<ClusterParts>,
    config: Arc<SchedulerConfig>,
}

impl ClusterContext {
    /// Bundles store handles and configuration for one node.
    ///
    /// # Arguments
    /// * `parts` - Store handles of the node, usually from a backend constructor
    /// * `config` - Validated scheduler configuration
    pub fn new(parts: ClusterParts, config: SchedulerConfig) -> Self {
        Self {
            parts: Arc::new(parts),
            config: Arc::new(config),
        }
    }

    /// Wires a context on top of the in-process backend.
    pub fn from_memory(node: &MemoryNode, config: SchedulerConfig) -> Result<Self> {
        let parts = ClusterParts {
            node_id: node.node_id().clone(),
            tasks: node.map(protocol::TASKS_MAP)?,
            contexts: node.map(protocol::CONTEXTS_MAP)?,
            benchmarks: node.map(protocol::BENCHMARKS_MAP)?,
            runtimes: node.map(protocol::RUNTIMES_MAP)?,
            topics: node.topics()?,
            objects: node.objects(),
            membership: node.membership(),
        };
        Ok(Self::new(parts, config))
    }

    pub fn node_id(&self) -> &NodeId {
        &self.parts.node_id
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn task_map(&self) -> &dyn EntryMap<TaskEntry> {
        self.parts.tasks.as_ref()
    }

    pub fn context_map(&self) -> &dyn EntryMap<TaskContextEntry> {
        self.parts.contexts.as_ref()
    }

    pub fn benchmark_map(&self) -> &dyn EntryMap<BenchmarkEntry> {
        self.parts.benchmarks.as_ref()
    }

    pub fn runtime_map(&self) -> &dyn EntryMap<RuntimeInfo> {
        self.parts.runtimes.as_ref()
    }

    pub fn topics(&self) -> &dyn Topics<ClusterMessage> {
        self.parts.topics.as_ref()
    }

    pub fn objects(&self) -> &dyn ClusterObjects {
        self.parts.objects.as_ref()
    }

    pub fn membership(&self) -> &dyn Membership {
        self.parts.membership.as_ref()
    }

    pub fn tasks(&self) -> Tasks {
        Tasks::new(self.clone())
    }

    pub fn contexts(&self) -> TaskContexts {
        TaskContexts::new(self.clone())
    }

    pub fn benchmarks(&self) -> Benchmarks {
        Benchmarks::new(self.clone())
    }
}
