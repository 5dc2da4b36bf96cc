//! Scheduling Actions
//!
//! One action per `TaskMessage` variant. Actions run one at a time on the node's processor, but
//! other nodes may act on the same entries concurrently, so every change goes through a lock
//! plus version re-check or through a version-checked transaction.

mod abort;
mod change_owner;
mod check;
mod checker;
mod reschedule;
mod run_context;
mod schedule;

pub use abort::AbortTaskAction;
pub use change_owner::ChangeOwnerTaskAction;
pub use check::CheckSchedulabilityAction;
pub use checker::TaskContextCheckerAction;
pub use reschedule::RescheduleTaskAction;
pub use run_context::RunContextAction;
pub use schedule::ScheduleTaskAction;

use crate::cluster::ClusterContext;
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait TaskAction: Send + Sync {
    async fn execute(&self, cluster: &ClusterContext) -> Result<()>;
}
