use crate::cluster::ClusterContext;
use crate::cluster::protocol::{CONTEXT_STATE_TOPIC, ClusterMessage};
use crate::error::Result;
use crate::manager::msg::TaskMessage;
use crate::manager::queue::ActionQueue;
use crate::model::{ContextState, TaskContextEntry};
use crate::store::EntryEvent;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Receives context state changes, e.g. to persist them for later inspection.
#[async_trait]
pub trait ContextStateNotifier: Send + Sync {
    async fn context_state_changed(&self, context_id: &str, state: ContextState) -> Result<()>;
}

/// Publishes context state changes on `CONTEXT_STATE_TOPIC`.
pub struct TopicStateNotifier {
    cluster: ClusterContext,
}

impl TopicStateNotifier {
    pub fn new(cluster: ClusterContext) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ContextStateNotifier for TopicStateNotifier {
    async fn context_state_changed(&self, context_id: &str, state: ContextState) -> Result<()> {
        self.cluster
            .topics()
            .publish(
                CONTEXT_STATE_TOPIC,
                ClusterMessage::ContextStateChanged {
                    context_id: context_id.to_string(),
                    state,
                },
            )
            .await?;
        Ok(())
    }
}

pub struct ContextListener {
    cluster: ClusterContext,
    queue: ActionQueue,
    notifier: Arc<dyn ContextStateNotifier>,
}

impl ContextListener {
    pub fn new(
        cluster: ClusterContext,
        queue: ActionQueue,
        notifier: Arc<dyn ContextStateNotifier>,
    ) -> Self {
        Self {
            cluster,
            queue,
            notifier,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        let events = self.cluster.context_map().subscribe_local();
        let listener = Arc::new(self);
        super::drive("context", events, move |event| {
            let listener = listener.clone();
            async move {
                let key = event.key().to_string();
                if let Err(e) = listener.handle(event).await {
                    tracing::warn!(context_id = %key, error = %e, "context event handling failed");
                }
            }
        })
    }

    pub async fn handle(&self, event: EntryEvent<TaskContextEntry>) -> Result<()> {
        match event {
            EntryEvent::Added { key, .. } => {
                self.queue.send(TaskMessage::RunContext { context_id: key });
                Ok(())
            }
            EntryEvent::Updated { key, value, .. } => {
                self.notifier
                    .context_state_changed(&key, value.value.state)
                    .await
            }
            EntryEvent::Removed { key, .. } | EntryEvent::Evicted { key, .. } => {
                tracing::debug!(context_id = %key, "context gone");
                Ok(())
            }
        }
    }
}
