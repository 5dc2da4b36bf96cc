use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::error::Result;
use crate::model::TaskEntry;
use crate::store::Versioned;
use async_trait::async_trait;

/// Finishes the context of a task that just reached a final state, once every task of the
/// context is final.
pub struct TaskContextCheckerAction {
    entry: Versioned<TaskEntry>,
}

impl TaskContextCheckerAction {
    pub fn new(entry: Versioned<TaskEntry>) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl TaskAction for TaskContextCheckerAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        cluster
            .contexts()
            .finish_if_complete(&self.entry.value.task_context_id)
            .await?;
        Ok(())
    }
}
