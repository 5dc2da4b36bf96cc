//! Task Manager
//!
//! The per-node scheduling service. It wires the store's change notifications to a single
//! action processor:
//!
//! ```text
//! store events ──> listeners ──┐
//!                              ├──> ActionQueue ──> processor ──> actions ──> store
//! timer ──────────> scanner ───┘
//! ```
//!
//! ## Submodules
//! - **`msg`**: the `TaskMessage` union and its mapping to actions.
//! - **`queue`** / **`processor`**: the single-consumer queue and the loop draining it.
//! - **`action`**: scheduling, dependency checks, aborts, reclaim, reschedule, context checks.
//! - **`listener`**: task, runtime, context and membership listeners.
//! - **`scanner`**: periodic reconciliation of locally owned tasks.
//! - **`selector`**: runtime selection strategies.

pub mod action;
pub mod listener;
pub mod msg;
pub mod processor;
pub mod queue;
pub mod scanner;
pub mod selector;

#[cfg(test)]
mod tests;

pub use msg::TaskMessage;
pub use queue::ActionQueue;
pub use scanner::{LocalKeyScanner, ScanReport};

use crate::cluster::ClusterContext;
use listener::{
    ContextListener, ContextStateNotifier, MembershipListener, RuntimeListener, TaskListener,
    TopicStateNotifier,
};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Handle on the scheduling service of one node.
pub struct TaskManager {
    cluster: ClusterContext,
    /// Producer side of the action queue; `stop` sends `Poison` through it.
    queue: ActionQueue,
    /// The single consumer running actions one at a time.
    processor: JoinHandle<()>,
    /// Listeners and the scanner, aborted on stop.
    background: Vec<JoinHandle<()>>,
}

impl TaskManager {
    /// Starts the processor, the listeners and the scanner. Context state changes are published
    /// on the context-state topic.
    pub fn start(cluster: ClusterContext) -> Self {
        let notifier = Arc::new(TopicStateNotifier::new(cluster.clone()));
        Self::start_with_notifier(cluster, notifier)
    }

    /// Same as [`TaskManager::start`] with a caller-supplied context state sink.
    ///
    /// # Arguments
    /// * `cluster` - Store access of the local node
    /// * `notifier` - Receives every context state change seen by the context listener
    pub fn start_with_notifier(
        cluster: ClusterContext,
        notifier: Arc<dyn ContextStateNotifier>,
    ) -> Self {
        let (queue, receiver) = ActionQueue::channel();
        let processor = processor::spawn(cluster.clone(), receiver);

        let membership_events = cluster.membership().subscribe();
        let background = vec![
            TaskListener::new(cluster.clone(), queue.clone()).spawn(),
            RuntimeListener::new(cluster.clone(), queue.clone()).spawn(),
            ContextListener::new(cluster.clone(), queue.clone(), notifier).spawn(),
            MembershipListener::new(cluster.node_id().clone(), membership_events).spawn(),
            LocalKeyScanner::new(cluster.clone(), queue.clone()).spawn(),
        ];

        tracing::info!(node = %cluster.node_id(), "task manager started");
        Self {
            cluster,
            queue,
            processor,
            background,
        }
    }

    pub fn cluster(&self) -> &ClusterContext {
        &self.cluster
    }

    /// Handle for injecting messages, e.g. from tooling or tests.
    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Poisons the queue, waits for the processor to drain up to the poison, then stops the
    /// listeners and the scanner.
    pub async fn stop(self) {
        self.queue.send(TaskMessage::Poison);
        drop(self.queue);

        if let Err(e) = self.processor.await {
            tracing::error!(error = %e, "action processor terminated abnormally");
        }
        for handle in self.background {
            handle.abort();
        }
        tracing::info!(node = %self.cluster.node_id(), "task manager stopped");
    }
}
