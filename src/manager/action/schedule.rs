use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::cluster::protocol::{ClusterMessage, GLOBAL_TOPIC, lease_counter_name};
use crate::error::{Result, SchedulerError};
use crate::manager::selector::selection_for;
use crate::model::{TaskEntry, TaskState};
use crate::store::{Expiry, Versioned};
use async_trait::async_trait;

/// Where a task's dependency stands.
pub(crate) enum Dependency {
    /// No dependency, or it finished.
    Resolved,
    Pending,
    /// The dependency was aborted or no longer exists; the task can never run.
    Failed(String),
}

pub(crate) async fn dependency_of(cluster: &ClusterContext, task: &TaskEntry) -> Result<Dependency> {
    let Some(dependency_id) = &task.task_dependency else {
        return Ok(Dependency::Resolved);
    };

    let dependency = match cluster.task_map().get(dependency_id).await? {
        Some(dependency) => dependency.value,
        None => {
            return Ok(Dependency::Failed(format!(
                "dependency '{dependency_id}' no longer exists"
            )));
        }
    };

    Ok(match dependency.state {
        TaskState::Finished => Dependency::Resolved,
        TaskState::Aborted => {
            Dependency::Failed(format!("dependency '{dependency_id}' was aborted"))
        }
        _ => Dependency::Pending,
    })
}

/// Aborts `entry` with a version-checked write, without taking the lock. Used for tasks this
/// node never claimed.
pub(crate) async fn abort_unclaimed(
    cluster: &ClusterContext,
    entry: &Versioned<TaskEntry>,
    reason: &str,
) -> Result<()> {
    match cluster.tasks().write_aborted(entry.clone(), reason).await {
        Ok(_) => Ok(()),
        Err(SchedulerError::Conflict(_)) => {
            tracing::debug!(task_id = %entry.value.id, "task changed before it could be aborted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Claims a submitted or waiting task for this node and assigns it a runtime.
///
/// 1. Pick a runtime. No candidate aborts the task.
/// 2. Take the task lock; a timeout abandons the attempt.
/// 3. Re-read under the lock. A different version means someone else already acted.
/// 4. Write owner, runtime and `SCHEDULED` with the safety-net TTL, then unlock.
/// 5. Tell the runtime to start the task.
pub struct ScheduleTaskAction {
    entry: Versioned<TaskEntry>,
}

impl ScheduleTaskAction {
    pub fn new(entry: Versioned<TaskEntry>) -> Self {
        Self { entry }
    }

    async fn claim(&self, cluster: &ClusterContext, runtime_id: &str) -> Result<bool> {
        let task_id = &self.entry.value.id;
        let current = cluster.task_map().get(task_id).await?;
        if current.as_ref().map(|current| current.version) != Some(self.entry.version) {
            tracing::debug!(task_id = %task_id, "task changed since it was read, discarding");
            return Ok(false);
        }

        let mut entry = self.entry.value.clone();
        entry.owner_id = Some(cluster.node_id().clone());
        entry.runtime_id = Some(runtime_id.to_string());
        entry.set_state(TaskState::Scheduled, format!("scheduled on runtime {runtime_id}"));

        let written = cluster
            .task_map()
            .replace_if_version(
                task_id,
                self.entry.version,
                entry,
                Expiry::After(cluster.config().scheduled_ttl()),
            )
            .await?;
        if written.is_none() {
            return Ok(false);
        }

        cluster
            .objects()
            .set_counter(
                &lease_counter_name(task_id),
                cluster.config().scheduled_lease_passes,
            )
            .await?;
        Ok(true)
    }
}

#[async_trait]
impl TaskAction for ScheduleTaskAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        let task = &self.entry.value;

        if !task.state.is_schedulable() {
            tracing::debug!(task_id = %task.id, state = %task.state, "task not schedulable");
            return Ok(());
        }

        match dependency_of(cluster, task).await? {
            Dependency::Resolved => {}
            Dependency::Pending => {
                if task.state != TaskState::Waiting {
                    let mut waiting = task.clone();
                    waiting.set_state(TaskState::Waiting, "waiting for dependency");
                    cluster
                        .task_map()
                        .replace_if_version(&task.id, self.entry.version, waiting, Expiry::Keep)
                        .await?;
                }
                return Ok(());
            }
            Dependency::Failed(reason) => {
                return abort_unclaimed(cluster, &self.entry, &reason).await;
            }
        }

        let runtime_id = match selection_for(task).select(cluster.runtime_map(), task).await {
            Ok(runtime_id) => runtime_id,
            Err(SchedulerError::NoRuntimeFound(_)) => {
                tracing::info!(task_id = %task.id, "no runtime found, aborting task");
                return abort_unclaimed(cluster, &self.entry, "no runtime found").await;
            }
            Err(e) => return Err(e),
        };

        let Some(token) = cluster
            .task_map()
            .try_lock(&task.id, cluster.config().lock_timeout())
            .await?
        else {
            tracing::debug!(task_id = %task.id, "lock timeout, abandoning schedule attempt");
            return Ok(());
        };

        let claimed = self.claim(cluster, &runtime_id).await;
        cluster.task_map().unlock(&task.id, &token).await?;
        if !claimed? {
            return Ok(());
        }

        tracing::info!(task_id = %task.id, runtime_id = %runtime_id, "task scheduled");
        cluster
            .topics()
            .publish(
                GLOBAL_TOPIC,
                ClusterMessage::RunTask {
                    sender_id: cluster.node_id().clone(),
                    receiver_id: runtime_id,
                    task_id: task.id.clone(),
                },
            )
            .await?;
        Ok(())
    }
}
