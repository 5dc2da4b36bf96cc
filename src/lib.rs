//! Distributed Benchmark Task Scheduler Library
//!
//! Many nodes run this same scheduling logic against one shared, replicated store. Each task is
//! driven by at most one node at a time; nodes may race, crash or lose partitions, and the
//! scheduler recovers through locking, version checks and periodic reconciliation.
//!
//! ## Architecture Modules
//!
//! - **`model`**: tasks, task contexts, benchmarks and host runtime descriptors.
//! - **`store`**: the replicated store interface the scheduler consumes, plus an in-process
//!   backend used by tests and single-node deployments.
//! - **`cluster`**: the per-node `ClusterContext` and the task, context and benchmark APIs.
//! - **`manager`**: listeners, the action queue and processor, scheduling actions, the key
//!   scanner and runtime selection.
//! - **`config`**, **`error`**, **`logging`**: ambient plumbing.

pub mod cluster;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod model;
pub mod store;

pub use cluster::ClusterContext;
pub use config::SchedulerConfig;
pub use error::{Result, SchedulerError};
pub use manager::TaskManager;
