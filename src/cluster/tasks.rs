//! Task API
//!
//! Entry points touching single tasks: submission, kill requests, and the write-backs a host
//! runtime performs (acknowledgement and final state). Every read-modify-write runs either under
//! the task's distributed lock or as a version-checked write.

use super::ClusterContext;
use super::protocol::{ClusterMessage, GLOBAL_TOPIC, lease_counter_name};
use crate::error::{Result, SchedulerError};
use crate::model::{TaskEntry, TaskState};
use crate::store::{Expiry, LockToken, ObjectKind, Versioned};

pub struct Tasks {
    cluster: ClusterContext,
}

impl Tasks {
    pub fn new(cluster: ClusterContext) -> Self {
        Self { cluster }
    }

    /// Stores a new task. Scheduling starts once the owning node sees the entry.
    pub async fn submit(&self, entry: TaskEntry) -> Result<String> {
        let id = entry.id.clone();
        let inserted = self
            .cluster
            .task_map()
            .put_if_absent(&id, entry, Expiry::Never)
            .await?;

        if inserted.is_none() {
            return Err(SchedulerError::IllegalState(format!("task '{id}' already exists")));
        }
        tracing::debug!(task_id = %id, "task submitted");
        Ok(id)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<Versioned<TaskEntry>>> {
        Ok(self.cluster.task_map().get(task_id).await?)
    }

    pub async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<Versioned<TaskEntry>>> {
        let matches = self
            .cluster
            .task_map()
            .query(&|entry: &TaskEntry| entry.state == state)
            .await?;
        Ok(matches.into_iter().map(|(_, entry)| entry).collect())
    }

    pub async fn tasks_on_runtime(&self, runtime_id: &str) -> Result<Vec<Versioned<TaskEntry>>> {
        let matches = self
            .cluster
            .task_map()
            .query(&|entry: &TaskEntry| entry.runtime_id.as_deref() == Some(runtime_id))
            .await?;
        Ok(matches.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Tasks of `context_id` that wait for `task_id`.
    pub async fn dependents_of(
        &self,
        context_id: &str,
        task_id: &str,
    ) -> Result<Vec<Versioned<TaskEntry>>> {
        let matches = self
            .cluster
            .task_map()
            .query(&|entry: &TaskEntry| {
                entry.task_context_id == context_id
                    && entry.task_dependency.as_deref() == Some(task_id)
            })
            .await?;
        Ok(matches.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Kills a task.
    ///
    /// Tasks that are not scheduled yet are aborted on the spot. For a scheduled task the request
    /// is relayed to its runtime and the entry stays as it is until the runtime reports back.
    /// Killing a finished or aborted task is an error.
    pub async fn kill(&self, task_id: &str, reason: &str) -> Result<()> {
        let token = self.lock(task_id).await?;
        let result = self.kill_locked(task_id, reason).await;
        self.unlock(task_id, &token).await?;

        if let Some(message) = result? {
            self.cluster.topics().publish(GLOBAL_TOPIC, message).await?;
        }
        Ok(())
    }

    async fn kill_locked(&self, task_id: &str, reason: &str) -> Result<Option<ClusterMessage>> {
        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task", task_id))?;

        match current.value.state {
            TaskState::Finished | TaskState::Aborted => Err(SchedulerError::IllegalState(format!(
                "task '{task_id}' is already {}",
                current.value.state
            ))),
            TaskState::Scheduled => {
                let Some(runtime_id) = current.value.runtime_id.clone() else {
                    return Err(SchedulerError::IllegalState(format!(
                        "scheduled task '{task_id}' has no runtime"
                    )));
                };
                tracing::info!(task_id, runtime_id = %runtime_id, "relaying kill request");
                Ok(Some(ClusterMessage::KillTask {
                    receiver_id: runtime_id,
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                }))
            }
            TaskState::Submitted | TaskState::Waiting => {
                self.write_aborted(current, &format!("killed: {reason}")).await?;
                Ok(None)
            }
        }
    }

    /// Aborts a task unless it already reached a terminal state. Returns whether it was aborted.
    pub async fn abort(&self, task_id: &str, reason: &str) -> Result<bool> {
        let token = self.lock(task_id).await?;
        let result = self.abort_locked(task_id, reason).await;
        self.unlock(task_id, &token).await?;

        let Some(aborted) = result? else {
            return Ok(false);
        };
        self.cluster
            .topics()
            .publish(
                GLOBAL_TOPIC,
                ClusterMessage::AbortTask {
                    receiver_id: aborted.runtime_id,
                    task_id: task_id.to_string(),
                    reason: reason.to_string(),
                },
            )
            .await?;
        Ok(true)
    }

    async fn abort_locked(&self, task_id: &str, reason: &str) -> Result<Option<TaskEntry>> {
        match self.get(task_id).await? {
            Some(current) if !current.value.state.is_terminal() => {
                Ok(Some(self.write_aborted(current, reason).await?))
            }
            _ => Ok(None),
        }
    }

    /// Version-checked transition to `Aborted` with the terminal TTL.
    pub(crate) async fn write_aborted(
        &self,
        current: Versioned<TaskEntry>,
        reason: &str,
    ) -> Result<TaskEntry> {
        let mut entry = current.value;
        entry.set_state(TaskState::Aborted, reason);
        self.cluster
            .task_map()
            .replace_if_version(
                &entry.id,
                current.version,
                entry.clone(),
                Expiry::After(self.cluster.config().task_ttl()),
            )
            .await?
            .ok_or_else(|| SchedulerError::Conflict(entry.id.clone()))?;

        self.clear_lease(&entry.id).await?;
        tracing::info!(task_id = %entry.id, reason, "task aborted");
        Ok(entry)
    }

    /// Runtime acknowledgement of a scheduled task: drops the safety-net TTL and the lease.
    pub async fn acknowledge(&self, task_id: &str, runtime_id: &str) -> Result<()> {
        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task", task_id))?;

        if current.value.state != TaskState::Scheduled
            || current.value.runtime_id.as_deref() != Some(runtime_id)
        {
            return Err(SchedulerError::IllegalState(format!(
                "task '{task_id}' is not scheduled on runtime '{runtime_id}'"
            )));
        }

        self.cluster
            .task_map()
            .replace_if_version(task_id, current.version, current.value, Expiry::Never)
            .await?
            .ok_or_else(|| SchedulerError::Conflict(task_id.to_string()))?;
        self.clear_lease(task_id).await?;
        tracing::debug!(task_id, runtime_id, "task acknowledged");
        Ok(())
    }

    /// Final state written back by the runtime. This is the only completion signal.
    pub async fn report_state(&self, task_id: &str, state: TaskState, reason: &str) -> Result<()> {
        if !state.is_terminal() {
            return Err(SchedulerError::Validation(format!(
                "runtimes may only report FINISHED or ABORTED, got {state}"
            )));
        }

        let current = self
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("task", task_id))?;
        if current.value.state.is_terminal() {
            return Err(SchedulerError::IllegalState(format!(
                "task '{task_id}' is already {}",
                current.value.state
            )));
        }

        let mut entry = current.value;
        entry.set_state(state, reason);
        self.cluster
            .task_map()
            .replace_if_version(
                task_id,
                current.version,
                entry,
                Expiry::After(self.cluster.config().task_ttl()),
            )
            .await?
            .ok_or_else(|| SchedulerError::Conflict(task_id.to_string()))?;

        self.clear_lease(task_id).await?;
        tracing::info!(task_id, state = %state, "task reached final state");
        Ok(())
    }

    async fn clear_lease(&self, task_id: &str) -> Result<()> {
        self.cluster
            .objects()
            .destroy(ObjectKind::Counter, &lease_counter_name(task_id))
            .await?;
        Ok(())
    }

    async fn lock(&self, task_id: &str) -> Result<LockToken> {
        self.cluster
            .task_map()
            .try_lock(task_id, self.cluster.config().lock_timeout())
            .await?
            .ok_or_else(|| SchedulerError::LockTimeout(task_id.to_string()))
    }

    async fn unlock(&self, task_id: &str, token: &LockToken) -> Result<()> {
        Ok(self.cluster.task_map().unlock(task_id, token).await?)
    }
}
