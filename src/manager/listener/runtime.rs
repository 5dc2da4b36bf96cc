use crate::cluster::ClusterContext;
use crate::error::Result;
use crate::manager::msg::TaskMessage;
use crate::manager::queue::ActionQueue;
use crate::model::{RuntimeInfo, TaskState};
use crate::store::EntryEvent;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Watches host runtimes.
///
/// New capacity (a runtime joining or going idle) re-evaluates waiting tasks. A runtime that
/// disappears takes its tasks down with it: every unfinished task assigned to it is aborted.
pub struct RuntimeListener {
    cluster: ClusterContext,
    queue: ActionQueue,
}

impl RuntimeListener {
    pub fn new(cluster: ClusterContext, queue: ActionQueue) -> Self {
        Self { cluster, queue }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.cluster.runtime_map().subscribe_local();
        let listener = Arc::new(self);
        super::drive("runtime", events, move |event| {
            let listener = listener.clone();
            async move {
                let key = event.key().to_string();
                if let Err(e) = listener.handle(event).await {
                    tracing::warn!(runtime_id = %key, error = %e, "runtime event handling failed");
                }
            }
        })
    }

    pub async fn handle(&self, event: EntryEvent<RuntimeInfo>) -> Result<()> {
        match event {
            EntryEvent::Added { key, .. } => {
                tracing::info!(runtime_id = %key, "runtime registered");
                self.reevaluate_waiting().await
            }
            EntryEvent::Updated { key, old, value } => {
                if old.task_count > 0 && value.value.is_idle() {
                    tracing::debug!(runtime_id = %key, "runtime became idle");
                    self.reevaluate_waiting().await?;
                }
                Ok(())
            }
            EntryEvent::Removed { key, .. } | EntryEvent::Evicted { key, .. } => {
                self.abort_tasks_on(&key).await
            }
        }
    }

    async fn reevaluate_waiting(&self) -> Result<()> {
        for entry in self.cluster.tasks().tasks_in_state(TaskState::Waiting).await? {
            self.queue.send(TaskMessage::ScheduleTask(entry));
        }
        Ok(())
    }

    async fn abort_tasks_on(&self, runtime_id: &str) -> Result<()> {
        let orphaned: Vec<_> = self
            .cluster
            .tasks()
            .tasks_on_runtime(runtime_id)
            .await?
            .into_iter()
            .filter(|entry| !entry.value.state.is_terminal())
            .collect();

        tracing::warn!(runtime_id, tasks = orphaned.len(), "runtime left, aborting its tasks");
        for entry in orphaned {
            self.queue.send(TaskMessage::AbortTask {
                task_id: entry.value.id,
                reason: format!("runtime {runtime_id} left the cluster"),
            });
        }
        Ok(())
    }
}
