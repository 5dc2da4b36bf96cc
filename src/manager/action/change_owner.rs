use super::TaskAction;
use crate::cluster::ClusterContext;
use crate::error::Result;
use crate::model::TaskEntry;
use crate::store::{Expiry, Transaction, Versioned};
use async_trait::async_trait;

/// Claims ownership of a task this node's partition holds but another (or no) node owns.
///
/// Best effort: if the entry moved since the scan read it, the transaction is rolled back and
/// the next scan pass tries again.
pub struct ChangeOwnerTaskAction {
    entry: Versioned<TaskEntry>,
}

impl ChangeOwnerTaskAction {
    pub fn new(entry: Versioned<TaskEntry>) -> Self {
        Self { entry }
    }
}

#[async_trait]
impl TaskAction for ChangeOwnerTaskAction {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()> {
        let task_id = &self.entry.value.id;
        let tx = Transaction::begin(cluster.task_map(), task_id).await?;

        if tx.verify(self.entry.version).is_err() {
            tx.rollback();
            tracing::debug!(task_id = %task_id, "task changed since the scan, skipping reclaim");
            return Ok(());
        }
        if self.entry.value.is_owned_by(cluster.node_id()) {
            tx.rollback();
            return Ok(());
        }

        let mut entry = self.entry.value.clone();
        let previous = entry.owner_id.replace(cluster.node_id().clone());
        match tx.commit(entry, Expiry::Keep).await {
            Ok(_) => {
                tracing::info!(
                    task_id = %task_id,
                    previous_owner = ?previous,
                    "took over task ownership"
                );
            }
            Err(e) => {
                tracing::debug!(task_id = %task_id, error = %e, "reclaim lost a race");
            }
        }
        Ok(())
    }
}
