use super::ClusterContext;
use crate::error::{Result, SchedulerError};
use crate::model::{BenchmarkEntry, GENERATOR_CONTEXT_ID, TaskDescriptor, TaskEntry};
use crate::store::{Expiry, Transaction, Versioned};
use std::collections::BTreeMap;

/// Benchmark submission and generator bookkeeping.
///
/// Generator tasks live in the lingering generator context, so they are scheduled like any
/// other task but never cause a context to finish.
pub struct Benchmarks {
    cluster: ClusterContext,
}

impl Benchmarks {
    pub fn new(cluster: ClusterContext) -> Self {
        Self { cluster }
    }

    /// Creates a benchmark and submits its generator task. Returns the benchmark id.
    ///
    /// # Arguments
    /// * `generator` - Descriptor of the generator task, placed in the generator context
    /// * `storage` - Initial key/value storage the generator keeps between runs
    pub async fn submit(
        &self,
        generator: TaskDescriptor,
        storage: BTreeMap<String, String>,
    ) -> Result<String> {
        let benchmark_id = uuid::Uuid::new_v4().to_string();
        let task = TaskEntry::new(generator, GENERATOR_CONTEXT_ID).with_benchmark(&benchmark_id);
        let entry = BenchmarkEntry {
            id: benchmark_id.clone(),
            generator_id: task.id.clone(),
            storage,
        };

        self.cluster
            .benchmark_map()
            .put_if_absent(&benchmark_id, entry, Expiry::Never)
            .await?
            .ok_or_else(|| {
                SchedulerError::IllegalState(format!("benchmark '{benchmark_id}' already exists"))
            })?;

        let contexts = self.cluster.contexts();
        contexts.add_generator_task(&task.id).await?;
        let task_id = self.cluster.tasks().submit(task).await?;

        tracing::info!(benchmark_id = %benchmark_id, generator_id = %task_id, "benchmark submitted");
        Ok(benchmark_id)
    }

    /// Replaces the generator of a benchmark whose previous generator is done.
    ///
    /// Returns the id of the new generator task.
    ///
    /// # Arguments
    /// * `benchmark_id` - Benchmark returned by [`Benchmarks::submit`]
    /// * `generator` - Descriptor of the next generator task
    pub async fn resubmit_generator(
        &self,
        benchmark_id: &str,
        generator: TaskDescriptor,
    ) -> Result<String> {
        let tx = Transaction::begin(self.cluster.benchmark_map(), benchmark_id).await?;
        let Some(current) = tx.snapshot().cloned() else {
            tx.rollback();
            return Err(SchedulerError::not_found("benchmark", benchmark_id));
        };

        let previous_id = current.value.generator_id.clone();
        if let Some(previous) = self.cluster.tasks().get(&previous_id).await?
            && !previous.value.state.is_terminal()
        {
            tx.rollback();
            return Err(SchedulerError::IllegalState(format!(
                "generator '{previous_id}' of benchmark '{benchmark_id}' is still {}",
                previous.value.state
            )));
        }

        let task = TaskEntry::new(generator, GENERATOR_CONTEXT_ID).with_benchmark(benchmark_id);
        let mut entry = current.value;
        entry.generator_id = task.id.clone();
        tx.commit(entry, Expiry::Keep).await?;

        let contexts = self.cluster.contexts();
        contexts.add_generator_task(&task.id).await?;
        contexts.remove_generator_task(&previous_id).await?;
        let task_id = self.cluster.tasks().submit(task).await?;

        tracing::info!(benchmark_id, previous_id = %previous_id, generator_id = %task_id, "generator resubmitted");
        Ok(task_id)
    }

    pub async fn get(&self, benchmark_id: &str) -> Result<Option<Versioned<BenchmarkEntry>>> {
        Ok(self.cluster.benchmark_map().get(benchmark_id).await?)
    }

    pub async fn all(&self) -> Result<Vec<BenchmarkEntry>> {
        let entries = self.cluster.benchmark_map().query(&|_: &BenchmarkEntry| true).await?;
        Ok(entries.into_iter().map(|(_, entry)| entry.value).collect())
    }
}
