//! Scheduler Data Model
//!
//! Plain records replicated through the shared store:
//!
//! - **`task`**: `TaskEntry`, its state machine and descriptor.
//! - **`context`**: `TaskContextEntry`, a group of tasks with dependency edges by name.
//! - **`benchmark`**: `BenchmarkEntry`, a generator task producing further work.
//! - **`runtime`**: `RuntimeInfo`, the host runtime descriptors maintained by the host registry.
//! - **`query`**: attribute queries restricting which runtimes may run a task.

pub mod benchmark;
pub mod context;
pub mod query;
pub mod runtime;
pub mod task;


pub use benchmark::BenchmarkEntry;
pub use context::{
    ContextState, ContextTask, GENERATOR_CONTEXT_ID, TaskContextDescriptor, TaskContextEntry,
    TaskTemplate, context_object_prefix,
};
pub use query::RuntimeQuery;
pub use runtime::RuntimeInfo;
pub use task::{Exclusivity, StateChange, TaskDescriptor, TaskEntry, TaskState};

/// Current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}
