use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::error::Result;
use async_trait::async_trait;

/// Aborts a task under its lock and notifies the runtime it was assigned to.
pub struct AbortTaskAction {
    task_id: String,
    reason: String,
}

impl AbortTaskAction {
    pub fn new(task_id: String, reason: String) -> Self {
        Self { task_id, reason }
    }
}

#[async_trait]
impl TaskAction for AbortTaskAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        let aborted = cluster.tasks().abort(&self.task_id, &self.reason).await?;
        if !aborted {
            tracing::debug!(task_id = %self.task_id, "task already final or gone, nothing to abort");
        }
        Ok(())
    }
}
