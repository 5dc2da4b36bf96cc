use crate::cluster::ClusterContext;
use crate::cluster::protocol::{ClusterMessage, GLOBAL_TOPIC, lease_counter_name};
use crate::error::Result;
use crate::manager::msg::TaskMessage;
use crate::manager::queue::ActionQueue;
use crate::model::{TaskEntry, TaskState};
use crate::store::{EntryEvent, Expiry, ObjectKind, Versioned};
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Turns changes of locally owned tasks into scheduling messages.
pub struct TaskListener {
    cluster: ClusterContext,
    queue: ActionQueue,
}

impl TaskListener {
    pub fn new(cluster: ClusterContext, queue: ActionQueue) -> Self {
        Self { cluster, queue }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.cluster.task_map().subscribe_local();
        let listener = Arc::new(self);
        super::drive("task", events, move |event| {
            let listener = listener.clone();
            async move {
                let key = event.key().to_string();
                if let Err(e) = listener.handle(event).await {
                    tracing::warn!(task_id = %key, error = %e, "task event handling failed");
                }
            }
        })
    }

    pub async fn handle(&self, event: EntryEvent<TaskEntry>) -> Result<()> {
        match event {
            EntryEvent::Added { value, .. } => self.on_added(value).await,
            EntryEvent::Updated { old, value, .. } => self.on_updated(old, value).await,
            EntryEvent::Removed { key, .. } => {
                tracing::trace!(task_id = %key, "task removed");
                Ok(())
            }
            EntryEvent::Evicted { key, old } => self.on_evicted(key, old).await,
        }
    }

    /// Only terminal tasks are meant to expire. A task evicted before it finished is written back
    /// as `ABORTED` so its dependents and its context still see it complete.
    async fn on_evicted(&self, key: String, old: TaskEntry) -> Result<()> {
        tracing::debug!(task_id = %key, state = %old.state, "task evicted");
        self.cluster
            .objects()
            .destroy(ObjectKind::Counter, &lease_counter_name(&key))
            .await?;
        if old.state.is_terminal() {
            return Ok(());
        }

        let mut aborted = old;
        aborted.set_state(TaskState::Aborted, "evicted before reaching a final state");
        let written = self
            .cluster
            .task_map()
            .put_if_absent(
                &key,
                aborted.clone(),
                Expiry::After(self.cluster.config().task_ttl()),
            )
            .await?;
        let Some(version) = written else {
            tracing::debug!(task_id = %key, "evicted task was already rewritten");
            return Ok(());
        };

        tracing::warn!(task_id = %key, runtime_id = ?aborted.runtime_id, "unfinished task evicted, aborted");
        self.cluster
            .topics()
            .publish(
                GLOBAL_TOPIC,
                ClusterMessage::AbortTask {
                    receiver_id: aborted.runtime_id.clone(),
                    task_id: key,
                    reason: "evicted before reaching a final state".to_string(),
                },
            )
            .await?;
        self.on_final(Versioned::new(version, aborted)).await
    }

    async fn on_added(&self, entry: Versioned<TaskEntry>) -> Result<()> {
        let task = &entry.value;
        if let Some(dependency_id) = &task.task_dependency
            && task.state == TaskState::Submitted
        {
            let pending = self
                .cluster
                .task_map()
                .get(dependency_id)
                .await?
                .is_some_and(|dependency| !dependency.value.state.is_terminal());
            if pending {
                let mut waiting = task.clone();
                waiting.set_state(TaskState::Waiting, "waiting for dependency");
                let written = self
                    .cluster
                    .task_map()
                    .replace_if_version(&task.id, entry.version, waiting, Expiry::Keep)
                    .await?;
                if written.is_none() {
                    tracing::debug!(task_id = %task.id, "task changed before it could wait");
                }
                return Ok(());
            }
        }

        self.queue.send(TaskMessage::NewTask(entry));
        Ok(())
    }

    async fn on_updated(&self, old: TaskEntry, entry: Versioned<TaskEntry>) -> Result<()> {
        let task = &entry.value;
        match task.state {
            TaskState::Waiting => {
                self.queue.send(TaskMessage::CheckSchedulability(entry));
            }
            TaskState::Finished | TaskState::Aborted if !old.state.is_terminal() => {
                self.on_final(entry).await?;
            }
            // Back to SUBMITTED after a reschedule, or a submitted task reclaimed from another node.
            TaskState::Submitted
                if old.state != TaskState::Submitted || old.owner_id != task.owner_id =>
            {
                self.queue.send(TaskMessage::ScheduleTask(entry));
            }
            _ => {}
        }
        Ok(())
    }

    /// Dependents are re-evaluated, then the context completion check runs.
    async fn on_final(&self, entry: Versioned<TaskEntry>) -> Result<()> {
        let dependents = self
            .cluster
            .tasks()
            .dependents_of(&entry.value.task_context_id, &entry.value.id)
            .await?;
        for dependent in dependents {
            self.queue.send(TaskMessage::ScheduleTask(dependent));
        }
        self.queue.send(TaskMessage::TaskChanged(entry));
        Ok(())
    }
}
