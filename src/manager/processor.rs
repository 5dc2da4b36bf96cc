use super::msg::TaskMessage;
use crate::cluster::ClusterContext;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Spawns the node's single action processor.
///
/// Messages are handled strictly one after another. Each action runs in its own task so a panic
/// is reported as a failed action instead of taking the loop down.
pub fn spawn(cluster: ClusterContext, mut receiver: mpsc::UnboundedReceiver<TaskMessage>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::debug!(node = %cluster.node_id(), "action processor started");

        while let Some(message) = receiver.recv().await {
            let kind = message.kind();
            let Some(action) = message.into_action() else {
                tracing::debug!("poison received");
                break;
            };

            let context = cluster.clone();
            let outcome = tokio::spawn(async move { action.execute(&context).await }).await;

            match outcome {
                Ok(Ok(())) => tracing::trace!(kind, "action done"),
                Ok(Err(e)) if e.is_soft() => {
                    tracing::debug!(kind, error = %e, "action gave up, will be retried by a later event");
                }
                Ok(Err(e)) => tracing::warn!(kind, error = %e, "action failed"),
                Err(e) => tracing::error!(kind, error = %e, "action panicked"),
            }
        }

        receiver.close();
        tracing::debug!(node = %cluster.node_id(), "action processor stopped");
    })
}
