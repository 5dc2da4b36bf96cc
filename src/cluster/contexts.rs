//! Task-Context Orchestrator
//!
//! ## Responsibilities
//! - **Submission**: validates a context descriptor and stores the context in `WAITING`.
//! - **Materialization** (`run_context`): resolves inline and template tasks, merges properties,
//!   rewrites `run_after_task` names into task ids and submits one task per declaration.
//! - **Cleanup**: once every task is done, destroys the context's ephemeral objects and
//!   re-persists the context and its tasks with their eviction TTLs.
//! - **Removal**: hard delete, only from `FINISHED`.
//! - **Generator context**: the lingering context holding benchmark generator tasks.

use super::ClusterContext;
use super::protocol::lease_counter_name;
use crate::error::{Result, SchedulerError};
use crate::model::{
    ContextState, ContextTask, GENERATOR_CONTEXT_ID, TaskContextDescriptor, TaskContextEntry,
    TaskDescriptor, TaskEntry, context_object_prefix,
};
use crate::store::{Expiry, LockToken, ObjectKind, Transaction, Versioned};
use std::collections::{BTreeMap, HashMap, HashSet};

pub struct TaskContexts {
    cluster: ClusterContext,
}

impl TaskContexts {
    pub fn new(cluster: ClusterContext) -> Self {
        Self { cluster }
    }

    /// Validates `descriptor` and stores a new `WAITING` context. Returns the context id.
    pub async fn submit(
        &self,
        descriptor: TaskContextDescriptor,
        benchmark_id: Option<String>,
    ) -> Result<String> {
        validate_descriptor(&descriptor)?;

        let entry = TaskContextEntry::new(descriptor, benchmark_id);
        let id = entry.id.clone();
        self.cluster
            .context_map()
            .put_if_absent(&id, entry, Expiry::Never)
            .await?
            .ok_or_else(|| SchedulerError::IllegalState(format!("context '{id}' already exists")))?;

        tracing::info!(context_id = %id, "task context submitted");
        Ok(id)
    }

    pub async fn get(&self, context_id: &str) -> Result<Option<Versioned<TaskContextEntry>>> {
        Ok(self.cluster.context_map().get(context_id).await?)
    }

    /// Materializes a `WAITING` context into tasks and flips it to `RUNNING`.
    ///
    /// Every task is stored before the context turns `RUNNING`, so a completion check never sees
    /// a running context with part of its tasks. Contexts in any other state are left alone, so
    /// delivering the same request twice is harmless.
    ///
    /// # Arguments
    /// * `context_id` - Id of a context previously returned by [`TaskContexts::submit`]
    pub async fn run_context(&self, context_id: &str) -> Result<()> {
        let token = self.lock(context_id).await?;
        let result = self.run_context_locked(context_id).await;
        self.unlock(context_id, &token).await?;

        if result? {
            // Tasks that finished while the context was still WAITING had nobody to report to.
            self.finish_if_complete(context_id).await?;
        }
        Ok(())
    }

    async fn run_context_locked(&self, context_id: &str) -> Result<bool> {
        let current = self
            .get(context_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("context", context_id))?;

        if current.value.state != ContextState::Waiting {
            tracing::debug!(context_id, state = %current.value.state, "context already started");
            return Ok(false);
        }

        let tasks = materialize(&current.value)?;
        let mut entry = current.value;
        entry.state = ContextState::Running;
        entry.contained_task = tasks.iter().map(|task| task.id.clone()).collect();

        let task_count = tasks.len();
        let submitter = self.cluster.tasks();
        for task in tasks {
            submitter.submit(task).await?;
        }

        self.cluster
            .context_map()
            .replace_if_version(context_id, current.version, entry, Expiry::Keep)
            .await?
            .ok_or_else(|| SchedulerError::Conflict(context_id.to_string()))?;

        tracing::info!(context_id, tasks = task_count, "task context running");
        Ok(true)
    }

    /// Finishes a `RUNNING` context once every contained task is final. Returns whether the
    /// context was handed to [`TaskContexts::cleanup`].
    ///
    /// Lingering and empty contexts never finish. A contained task that no longer exists was
    /// evicted after its final state and counts as final.
    ///
    /// # Arguments
    /// * `context_id` - Context to check; a missing context is ignored
    pub async fn finish_if_complete(&self, context_id: &str) -> Result<bool> {
        let Some(context) = self.get(context_id).await? else {
            return Ok(false);
        };

        let context = context.value;
        if context.lingering
            || context.state != ContextState::Running
            || context.contained_task.is_empty()
        {
            return Ok(false);
        }

        for task_id in &context.contained_task {
            if let Some(task) = self.cluster.task_map().get(task_id).await?
                && !task.value.state.is_terminal()
            {
                tracing::trace!(context_id, task_id = %task_id, "context still has running tasks");
                return Ok(false);
            }
        }

        self.cleanup(context_id).await?;
        Ok(true)
    }

    /// Retires a context whose tasks are all done.
    ///
    /// Ephemeral objects named after the context are destroyed; the context and its tasks are
    /// re-persisted with their eviction TTLs instead of being deleted.
    pub async fn cleanup(&self, context_id: &str) -> Result<()> {
        let prefix = context_object_prefix(context_id);
        let objects = self.cluster.objects();
        for kind in [ObjectKind::CheckpointMap, ObjectKind::Latch, ObjectKind::Counter] {
            for name in objects.object_names(kind).await? {
                if name.starts_with(&prefix) {
                    objects.destroy(kind, &name).await?;
                    tracing::debug!(context_id, object = %name, "destroyed context object");
                }
            }
        }

        let tx = Transaction::begin(self.cluster.context_map(), context_id).await?;
        let Some(current) = tx.snapshot().cloned() else {
            tx.rollback();
            return Ok(());
        };
        if current.value.lingering || current.value.state == ContextState::Finished {
            tx.rollback();
            return Ok(());
        }

        let mut entry = current.value;
        entry.state = ContextState::Finished;
        let contained: Vec<String> = entry.contained_task.iter().cloned().collect();
        tx.commit(entry, Expiry::After(self.cluster.config().context_ttl()))
            .await?;

        let task_ttl = Expiry::After(self.cluster.config().task_ttl());
        for task_id in contained {
            let Some(task) = self.cluster.task_map().get(&task_id).await? else {
                continue;
            };
            let written = self
                .cluster
                .task_map()
                .replace_if_version(&task_id, task.version, task.value, task_ttl)
                .await?;
            if written.is_none() {
                tracing::debug!(context_id, task_id = %task_id, "task moved during cleanup");
            }
        }

        tracing::info!(context_id, "task context finished");
        Ok(())
    }

    /// Deletes a finished context together with its tasks.
    pub async fn remove(&self, context_id: &str) -> Result<()> {
        let token = self.lock(context_id).await?;
        let result = self.remove_locked(context_id).await;
        self.unlock(context_id, &token).await?;
        result
    }

    async fn remove_locked(&self, context_id: &str) -> Result<()> {
        let current = self
            .get(context_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("context", context_id))?;

        if current.value.state != ContextState::Finished {
            return Err(SchedulerError::IllegalState(format!(
                "context '{context_id}' is {}, only FINISHED contexts can be removed",
                current.value.state
            )));
        }

        if !self
            .cluster
            .context_map()
            .remove_if_version(context_id, current.version)
            .await?
        {
            return Err(SchedulerError::Conflict(context_id.to_string()));
        }

        for task_id in &current.value.contained_task {
            self.cluster.task_map().remove(task_id).await?;
            self.cluster
                .objects()
                .destroy(ObjectKind::Counter, &lease_counter_name(task_id))
                .await?;
        }

        tracing::info!(context_id, "task context removed");
        Ok(())
    }

    /// Creates the lingering generator context unless it exists.
    pub async fn ensure_generator_context(&self) -> Result<()> {
        let created = self
            .cluster
            .context_map()
            .put_if_absent(
                GENERATOR_CONTEXT_ID,
                TaskContextEntry::generator(),
                Expiry::Never,
            )
            .await?;
        if created.is_some() {
            tracing::info!("created benchmark generator context");
        }
        Ok(())
    }

    pub async fn add_generator_task(&self, task_id: &str) -> Result<()> {
        self.update_generator_context(|entry| {
            entry.contained_task.insert(task_id.to_string());
        })
        .await
    }

    pub async fn remove_generator_task(&self, task_id: &str) -> Result<()> {
        self.update_generator_context(|entry| {
            entry.contained_task.remove(task_id);
        })
        .await
    }

    async fn update_generator_context(&self, update: impl FnOnce(&mut TaskContextEntry)) -> Result<()> {
        self.ensure_generator_context().await?;

        let token = self.lock(GENERATOR_CONTEXT_ID).await?;
        let result = async {
            let current = self
                .get(GENERATOR_CONTEXT_ID)
                .await?
                .ok_or_else(|| SchedulerError::not_found("context", GENERATOR_CONTEXT_ID))?;
            let mut entry = current.value;
            update(&mut entry);
            self.cluster
                .context_map()
                .replace_if_version(GENERATOR_CONTEXT_ID, current.version, entry, Expiry::Never)
                .await?
                .ok_or_else(|| SchedulerError::Conflict(GENERATOR_CONTEXT_ID.to_string()))?;
            Ok::<(), SchedulerError>(())
        }
        .await;
        self.unlock(GENERATOR_CONTEXT_ID, &token).await?;
        result
    }

    async fn lock(&self, context_id: &str) -> Result<LockToken> {
        self.cluster
            .context_map()
            .try_lock(context_id, self.cluster.config().lock_timeout())
            .await?
            .ok_or_else(|| SchedulerError::LockTimeout(context_id.to_string()))
    }

    async fn unlock(&self, context_id: &str, token: &LockToken) -> Result<()> {
        Ok(self.cluster.context_map().unlock(context_id, token).await?)
    }
}

/// Rejects descriptors that could never run to completion.
pub fn validate_descriptor(descriptor: &TaskContextDescriptor) -> Result<()> {
    if descriptor.tasks.is_empty() {
        return Err(SchedulerError::Validation(format!(
            "context '{}' declares no tasks",
            descriptor.name
        )));
    }

    let mut names = HashSet::new();
    for task in &descriptor.tasks {
        if !names.insert(task.name.as_str()) {
            return Err(SchedulerError::Validation(format!(
                "duplicate task name '{}'",
                task.name
            )));
        }
    }

    for task in &descriptor.tasks {
        match (&task.descriptor, &task.template) {
            (Some(_), Some(_)) => {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' declares both an inline descriptor and a template",
                    task.name
                )));
            }
            (None, None) => {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' declares neither a descriptor nor a template",
                    task.name
                )));
            }
            (None, Some(template)) if descriptor.template(template).is_none() => {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' references unknown template '{template}'",
                    task.name
                )));
            }
            _ => {}
        }

        if let Some(query) = resolve_descriptor(descriptor, task)
            .and_then(|resolved| resolved.host_runtimes)
        {
            query.validate().map_err(SchedulerError::Validation)?;
        }

        if let Some(after) = &task.run_after_task {
            if after == &task.name {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' depends on itself",
                    task.name
                )));
            }
            if !names.contains(after.as_str()) {
                return Err(SchedulerError::Validation(format!(
                    "task '{}' runs after unknown task '{after}'",
                    task.name
                )));
            }
        }
    }

    detect_cycle(descriptor)
}

/// Each task has at most one predecessor, so following `run_after_task` from any task either
/// ends or loops.
fn detect_cycle(descriptor: &TaskContextDescriptor) -> Result<()> {
    let edges: HashMap<&str, &str> = descriptor
        .tasks
        .iter()
        .filter_map(|task| Some((task.name.as_str(), task.run_after_task.as_deref()?)))
        .collect();

    for start in edges.keys() {
        let mut seen = HashSet::from([*start]);
        let mut current = *start;
        while let Some(&next) = edges.get(current) {
            if !seen.insert(next) {
                return Err(SchedulerError::Validation(format!(
                    "dependency cycle through task '{next}'"
                )));
            }
            current = next;
        }
    }
    Ok(())
}

/// The descriptor a context task runs with: inline, or a copy of its template renamed to the
/// task's name.
fn resolve_descriptor(context: &TaskContextDescriptor, task: &ContextTask) -> Option<TaskDescriptor> {
    match (&task.descriptor, &task.template) {
        (Some(descriptor), _) => Some(descriptor.clone()),
        (None, Some(template)) => context.template(template).map(|template| {
            let mut descriptor = template.descriptor.clone();
            descriptor.name = task.name.clone();
            descriptor
        }),
        (None, None) => None,
    }
}

/// Builds the task entries of a context with dependencies rewritten to task ids.
fn materialize(context: &TaskContextEntry) -> Result<Vec<TaskEntry>> {
    let declared = &context.descriptor;
    let mut tasks = Vec::with_capacity(declared.tasks.len());
    let mut ids: BTreeMap<&str, String> = BTreeMap::new();

    for task in &declared.tasks {
        let mut descriptor = resolve_descriptor(declared, task).ok_or_else(|| {
            SchedulerError::Validation(format!("task '{}' cannot be resolved", task.name))
        })?;

        // context < descriptor < per-task override
        let mut properties = declared.properties.clone();
        properties.extend(descriptor.properties);
        properties.extend(task.properties.clone());
        descriptor.properties = properties;

        let mut entry = TaskEntry::new(descriptor, context.id.clone());
        entry.benchmark_id = context.benchmark_id.clone();
        ids.insert(task.name.as_str(), entry.id.clone());
        tasks.push(entry);
    }

    for (entry, task) in tasks.iter_mut().zip(&declared.tasks) {
        if let Some(after) = &task.run_after_task {
            let dependency = ids.get(after.as_str()).ok_or_else(|| {
                SchedulerError::Validation(format!(
                    "task '{}' runs after unknown task '{after}'",
                    task.name
                ))
            })?;
            entry.task_dependency = Some(dependency.clone());
        }
    }

    // Submission order: every task after its dependency, so a new task never sees its
    // dependency missing.
    let parents: HashMap<&str, &str> = declared
        .tasks
        .iter()
        .filter_map(|task| Some((task.name.as_str(), task.run_after_task.as_deref()?)))
        .collect();
    let mut ordered: Vec<(usize, TaskEntry)> = declared
        .tasks
        .iter()
        .map(|task| chain_depth(&parents, &task.name))
        .zip(tasks)
        .collect();
    ordered.sort_by_key(|(depth, _)| *depth);

    Ok(ordered.into_iter().map(|(_, entry)| entry).collect())
}

/// Number of predecessors of `name`. Cycles were rejected at submission.
fn chain_depth(parents: &HashMap<&str, &str>, name: &str) -> usize {
    let mut depth = 0;
    let mut current = name;
    while let Some(&parent) = parents.get(current) {
        depth += 1;
        current = parent;
        if depth > parents.len() {
            break;
        }
    }
    depth
}
