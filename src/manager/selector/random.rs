use super::{RuntimeSelection, candidates, pick};
use crate::error::Result;
use crate::model::{RuntimeInfo, TaskEntry};
use crate::store::EntryMap;
use async_trait::async_trait;

/// Random runtime among those whose exclusivity admits the task.
pub struct RandomRuntimeSelection;

#[async_trait]
impl RuntimeSelection for RandomRuntimeSelection {
    async fn select(&self, runtimes: &dyn EntryMap<RuntimeInfo>, task: &TaskEntry) -> Result<String> {
        let candidates = candidates(runtimes, &|runtime: &RuntimeInfo| runtime.accepts(task)).await?;
        tracing::trace!(task_id = %task.id, candidates = candidates.len(), "exclusivity filter applied");
        pick(&candidates, task)
    }
}
