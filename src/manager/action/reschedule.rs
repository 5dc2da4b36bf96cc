use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::cluster::protocol::lease_counter_name;
use crate::error::Result;
use crate::model::{TaskEntry, TaskState};
use crate::store::{Expiry, ObjectKind, Transaction, Versioned};
use async_trait::async_trait;

/// Sends a scheduled task its runtime never acknowledged back to `SUBMITTED`.
pub struct RescheduleTaskAction {
    entry: Versioned<TaskEntry>,
}

impl RescheduleTaskAction {
    pub fn new(entry: Versioned<TaskEntry>) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl TaskAction for RescheduleTaskAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        let task_id = &self.entry.value.id;
        let tx = Transaction::begin(cluster.task_map(), task_id).await?;

        if tx.verify(self.entry.version).is_err() || self.entry.value.state != TaskState::Scheduled {
            tx.rollback();
            return Ok(());
        }

        let mut entry = self.entry.value.clone();
        let runtime_id = entry.runtime_id.take();
        entry.set_state(
            TaskState::Submitted,
            format!(
                "runtime {} did not acknowledge the task",
                runtime_id.as_deref().unwrap_or("?")
            ),
        );

        if let Err(e) = tx.commit(entry, Expiry::Never).await {
            tracing::debug!(task_id = %task_id, error = %e, "reschedule lost a race");
            return Ok(());
        }

        cluster
            .objects()
            .destroy(ObjectKind::Counter, &lease_counter_name(task_id))
            .await?;
        tracing::warn!(task_id = %task_id, runtime_id = ?runtime_id, "stale task sent back to scheduling");
        Ok(())
    }
}
