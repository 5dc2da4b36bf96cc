use super::types::NodeId;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub const DEFAULT_PARTITION_COUNT: u32 = 271;

/// Maps keys to partitions and partitions to their primary owner.
///
/// Ownership is derived from the sorted live member list, so every node computes the same
/// owner for a partition and a membership change migrates partitions without coordination.
pub struct PartitionManager {
    pub num_partitions: u32,
    members: Arc<DashMap<NodeId, ()>>,
}

impl PartitionManager {
    pub fn new(members: Arc<DashMap<NodeId, ()>>) -> Self {
        Self::with_partitions(members, DEFAULT_PARTITION_COUNT)
    }

    pub fn with_partitions(members: Arc<DashMap<NodeId, ()>>, num_partitions: u32) -> Self {
        Self {
            num_partitions: num_partitions.max(1),
            members,
        }
    }

    pub fn get_partition(&self, key: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let hash = hasher.finish() as u32;
        hash % self.num_partitions
    }

    pub fn get_owner(&self, partition: u32) -> Option<NodeId> {
        let mut node_ids: Vec<NodeId> = self
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        if node_ids.is_empty() {
            return None;
        }
        node_ids.sort();
        let primary_idx = (partition as usize) % node_ids.len();
        Some(node_ids.swap_remove(primary_idx))
    }

    pub fn owner_of(&self, key: &str) -> Option<NodeId> {
        self.get_owner(self.get_partition(key))
    }

    pub fn is_owner(&self, node: &NodeId, key: &str) -> bool {
        self.owner_of(key).as_ref() == Some(node)
    }

    pub fn primary_partitions(&self, node: &NodeId) -> Vec<u32> {
        (0..self.num_partitions)
            .filter(|&partition| self.get_owner(partition).as_ref() == Some(node))
            .collect()
    }
}
