//! Local Key Scanner
//!
//! Periodic reconciliation over the tasks whose partitions this node owns. Events cover the
//! common path; the scan repairs what events cannot see: owners that crashed, partitions that
//! migrated to this node, and runtimes that never picked up a task.
//!
//! Per owned key:
//! - owner empty or another node: reclaim (`ChangeOwner`)
//! - owned here and assigned to a runtime that is no longer registered: abort (`AbortTask`)
//! - owned here and `SCHEDULED`: burn one lease pass, reschedule once the lease runs out
//! - owned here and `WAITING`: re-check the dependency
//! - finished and aborted tasks are left to TTL eviction

use super::msg::TaskMessage;
use super::queue::ActionQueue;
use crate::cluster::ClusterContext;
use crate::cluster::protocol::lease_counter_name;
use crate::error::Result;
use crate::model::{RuntimeInfo, TaskState};
use std::collections::HashSet;
use tokio::task::JoinHandle;

/// What one pass queued.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    /// Locally owned task entries read during the pass.
    pub scanned: usize,
    /// `ChangeOwner` messages for tasks owned by another node or by nobody.
    pub reclaimed: usize,
    /// `AbortTask` messages for tasks whose runtime left the cluster.
    pub aborted: usize,
    /// `RescheduleTask` messages for scheduled tasks whose lease ran out.
    pub rescheduled: usize,
    /// `CheckSchedulability` messages for waiting tasks.
    pub rechecked: usize,
}

/// Periodic reconciler over the task keys this node owns.
pub struct LocalKeyScanner {
    /// Store access of the local node.
    cluster: ClusterContext,
    /// Where repairs are queued; the scanner never writes tasks itself.
    queue: ActionQueue,
}

impl LocalKeyScanner {
    /// Creates a scanner; nothing runs until [`LocalKeyScanner::spawn`] or a direct `scan`.
    pub fn new(cluster: ClusterContext, queue: ActionQueue) -> Self {
        Self { cluster, queue }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let initial_delay = self.cluster.config().scanner_initial_delay();
        let period = self.cluster.config().scanner_period();

        tokio::spawn(async move {
            tokio::time::sleep(initial_delay).await;
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match self.scan().await {
                    Ok(report) => tracing::debug!(?report, "local key scan done"),
                    Err(e) => tracing::warn!(error = %e, "local key scan failed"),
                }
            }
        })
    }

    pub async fn scan(&self) -> Result<ScanReport> {
        let node_id = self.cluster.node_id();
        let mut report = ScanReport::default();
        let live_runtimes: HashSet<String> = self
            .cluster
            .runtime_map()
            .query(&|_: &RuntimeInfo| true)
            .await?
            .into_iter()
            .map(|(runtime_id, _)| runtime_id)
            .collect();

        for key in self.cluster.task_map().local_keys().await? {
            let Some(entry) = self.cluster.task_map().get(&key).await? else {
                continue;
            };
            report.scanned += 1;

            if entry.value.state.is_terminal() {
                continue;
            }
            if !entry.value.is_owned_by(node_id) {
                self.queue.send(TaskMessage::ChangeOwner(entry));
                report.reclaimed += 1;
                continue;
            }
            if let Some(runtime_id) = &entry.value.runtime_id
                && !live_runtimes.contains(runtime_id)
            {
                self.queue.send(TaskMessage::AbortTask {
                    task_id: key.clone(),
                    reason: format!("runtime {runtime_id} is no longer registered"),
                });
                report.aborted += 1;
                continue;
            }

            match entry.value.state {
                TaskState::Scheduled => {
                    let remaining = self
                        .cluster
                        .objects()
                        .decrement_and_get(&lease_counter_name(&key))
                        .await?;
                    // No counter: the runtime acknowledged the task.
                    if remaining.is_some_and(|passes| passes <= 0) {
                        self.queue.send(TaskMessage::RescheduleTask(entry));
                        report.rescheduled += 1;
                    }
                }
                TaskState::Waiting => {
                    self.queue.send(TaskMessage::CheckSchedulability(entry));
                    report.rechecked += 1;
                }
                _ => {}
            }
        }

        Ok(report)
    }
}
