use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identity of a cluster member.
///
/// Every scheduling node gets one at startup; the id is what ends up in
/// `TaskEntry::owner_id` when the node claims a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored value together with the version it was written at.
///
/// Versions grow monotonically per map and are the basis of every
/// optimistic check: a writer that read version `n` may only replace the
/// entry while it is still at version `n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<V> {
    pub version: u64,
    pub value: V,
}

impl<V> Versioned<V> {
    pub fn new(version: u64, value: V) -> Self {
        Self { version, value }
    }

    pub fn into_value(self) -> V {
        self.value
    }
}

/// Time-to-live applied by a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    /// Entry lives until it is removed.
    Never,
    /// Entry is evicted once the duration elapses.
    After(Duration),
    /// Keep whatever TTL the entry currently has (`Never` for new entries).
    Keep,
}

/// Opaque proof of holding a distributed lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(pub String);

impl LockToken {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Change notification for a single key, delivered to the node that
/// currently owns the key's partition.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryEvent<V> {
    Added {
        key: String,
        value: Versioned<V>,
    },
    Updated {
        key: String,
        old: V,
        value: Versioned<V>,
    },
    Removed {
        key: String,
        old: V,
    },
    Evicted {
        key: String,
        old: V,
    },
}

impl<V> EntryEvent<V> {
    pub fn key(&self) -> &str {
        match self {
            EntryEvent::Added { key, .. }
            | EntryEvent::Updated { key, .. }
            | EntryEvent::Removed { key, .. }
            | EntryEvent::Evicted { key, .. } => key,
        }
    }
}

/// Cluster membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    MemberAdded(NodeId),
    MemberRemoved(NodeId),
    ClientConnected(String),
    ClientDisconnected(String),
}

/// Kinds of ephemeral cluster-wide objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Counter,
    Latch,
    CheckpointMap,
}
