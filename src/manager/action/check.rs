use super::TaskAction;
use super::schedule::{Dependency, ScheduleTaskAction, abort_unclaimed, dependency_of};
use crate::cluster::ClusterContext;
use crate::error::Result;
use crate::model::{TaskEntry, TaskState};
use crate::store::Versioned;
use async_trait::async_trait;

/// Re-evaluates a waiting task's dependency.
pub struct CheckSchedulabilityAction {
    entry: Versioned<TaskEntry>,
}

impl CheckSchedulabilityAction {
    pub fn new(entry: Versioned<TaskEntry>) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl TaskAction for CheckSchedulabilityAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        if self.entry.value.state != TaskState::Waiting {
            return Ok(());
        }

        match dependency_of(cluster, &self.entry.value).await? {
            Dependency::Resolved => {
                ScheduleTaskAction::new(self.entry.clone())
                    .execute(cluster)
                    .await
            }
            Dependency::Failed(reason) => abort_unclaimed(cluster, &self.entry, &reason).await,
            Dependency::Pending => Ok(()),
        }
    }
}
