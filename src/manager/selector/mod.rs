//! Runtime Selection
//!
//! A selection strategy picks the host runtime a task should run on. Tasks carrying a runtime
//! query use `QueryRuntimeSelection`; everything else uses `RandomRuntimeSelection`, which only
//! looks at runtime exclusivity.
//!
//! Both fail with `SchedulerError::NoRuntimeFound` on an empty candidate set. Callers abort the
//! task in that case instead of retrying.

mod query;
mod random;

pub use query::QueryRuntimeSelection;
pub use random::RandomRuntimeSelection;

use crate::error::{Result, SchedulerError};
use crate::model::{RuntimeInfo, TaskEntry};
use crate::store::EntryMap;
use async_trait::async_trait;
use rand::seq::SliceRandom;

#[async_trait]
pub trait RuntimeSelection: Send + Sync {
    /// Returns the id of the chosen runtime.
    async fn select(&self, runtimes: &dyn EntryMap<RuntimeInfo>, task: &TaskEntry) -> Result<String>;
}

/// The strategy matching `task`'s descriptor.
pub fn selection_for(task: &TaskEntry) -> Box<dyn RuntimeSelection> {
    match &task.descriptor.host_runtimes {
        Some(query) => Box::new(QueryRuntimeSelection::new(query.clone())),
        None => Box::new(RandomRuntimeSelection),
    }
}

async fn candidates(
    runtimes: &dyn EntryMap<RuntimeInfo>,
    filter: &(dyn Fn(&RuntimeInfo) -> bool + Send + Sync),
) -> Result<Vec<RuntimeInfo>> {
    let matches = runtimes.query(filter).await?;
    Ok(matches.into_iter().map(|(_, entry)| entry.value).collect())
}

/// Uniform pick among `candidates`.
fn pick(candidates: &[RuntimeInfo], task: &TaskEntry) -> Result<String> {
    candidates
        .choose(&mut rand::thread_rng())
        .map(|runtime| runtime.id.clone())
        .ok_or_else(|| SchedulerError::NoRuntimeFound(task.id.clone()))
}
