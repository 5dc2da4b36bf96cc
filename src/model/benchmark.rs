use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A benchmark: a generator task producing contexts, plus storage the generator keeps between
/// resubmissions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchmarkEntry {
    pub id: String,
    /// Id of the task currently acting as the generator.
    pub generator_id: String,
    pub storage: BTreeMap<String, String>,
}

impl BenchmarkEntry {
    pub fn new(generator_id: impl Into<String>, storage: BTreeMap<String, String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            generator_id: generator_id.into(),
            storage,
        }
    }
}
