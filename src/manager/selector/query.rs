use super::{RuntimeSelection, candidates, pick};
use crate::error::Result;
use crate::model::{RuntimeInfo, RuntimeQuery, TaskEntry};
use crate::store::EntryMap;
use async_trait::async_trait;

/// Random runtime among those matching an attribute query.
pub struct QueryRuntimeSelection {
    query: RuntimeQuery,
}

impl QueryRuntimeSelection {
    pub fn new(query: RuntimeQuery) -> Self {
        Self { query }
    }
}

#[async_trait]
impl RuntimeSelection for QueryRuntimeSelection {
    async fn select(&self, runtimes: &dyn EntryMap<RuntimeInfo>, task: &TaskEntry) -> Result<String> {
        let candidates =
            candidates(runtimes, &|runtime: &RuntimeInfo| self.query.matches(runtime)).await?;
        tracing::trace!(task_id = %task.id, candidates = candidates.len(), "runtime query applied");
        pick(&candidates, task)
    }
}
