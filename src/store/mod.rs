//! Distributed Store Interface
//!
//! The scheduler never talks to a concrete replicated store directly. It consumes the narrow
//! surface defined here, so the same scheduling logic runs on top of any backend that offers:
//!
//! - **Entry maps**: versioned get/put with TTL, compare-and-swap, timed locks, predicate queries
//!   and change notifications scoped to the keys this node owns.
//! - **Topics**: named broadcast channels.
//! - **Cluster objects**: atomic counters, countdown latches and checkpoint maps that can be
//!   enumerated and destroyed by name.
//! - **Membership**: who is in the cluster and who joins or leaves.
//!
//! `memory` is the in-process reference backend used by tests and single-node deployments.

pub mod error;
pub mod memory;
pub mod partitioner;
pub mod transaction;
pub mod types;


pub use error::{StoreError, StoreResult};
pub use transaction::Transaction;
pub use types::{
    EntryEvent, Expiry, LockToken, MembershipEvent, NodeId, ObjectKind, Versioned,
};

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Predicate evaluated against stored values by [`EntryMap::query`].
pub type Predicate<'a, V> = &'a (dyn Fn(&V) -> bool + Send + Sync);

/// A replicated map of string keys to values of type `V`, seen from one node.
#[async_trait]
pub trait EntryMap<V>: Send + Sync
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> StoreResult<Option<Versioned<V>>>;

    /// Unconditional write. Returns the new version.
    async fn put(&self, key: &str, value: V, expiry: Expiry) -> StoreResult<u64>;

    /// Writes only when the key is absent. Returns the new version, or `None` if the key exists.
    async fn put_if_absent(&self, key: &str, value: V, expiry: Expiry) -> StoreResult<Option<u64>>;

    /// Writes only while the entry is still at `expected`. Returns the new version, or `None`
    /// when the entry moved or disappeared.
    async fn replace_if_version(
        &self,
        key: &str,
        expected: u64,
        value: V,
        expiry: Expiry,
    ) -> StoreResult<Option<u64>>;

    async fn remove(&self, key: &str) -> StoreResult<Option<V>>;

    /// Removes the entry only while it is still at `expected`.
    async fn remove_if_version(&self, key: &str, expected: u64) -> StoreResult<bool>;

    /// Waits up to `timeout` for the lock on `key`. `None` means the wait timed out.
    async fn try_lock(&self, key: &str, timeout: Duration) -> StoreResult<Option<LockToken>>;

    async fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()>;

    async fn is_locked(&self, key: &str) -> StoreResult<bool>;

    async fn query(&self, predicate: Predicate<'_, V>) -> StoreResult<Vec<(String, Versioned<V>)>>;

    /// Keys whose partition is primarily owned by this node.
    async fn local_keys(&self) -> StoreResult<Vec<String>>;

    /// Change notifications for keys owned by this node.
    fn subscribe_local(&self) -> mpsc::UnboundedReceiver<EntryEvent<V>>;
}

/// Named broadcast channels carrying messages of type `M`.
#[async_trait]
pub trait Topics<M>: Send + Sync
where
    M: Clone + Send + Sync + 'static,
{
    /// Fire-and-forget publish. Succeeds even when nobody listens.
    async fn publish(&self, topic: &str, message: M) -> StoreResult<()>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<M>;
}

/// Ephemeral cluster-wide objects.
#[async_trait]
pub trait ClusterObjects: Send + Sync {
    async fn set_counter(&self, name: &str, value: i64) -> StoreResult<()>;

    /// Decrements an existing counter. Returns `None` if no counter with that name exists.
    async fn decrement_and_get(&self, name: &str) -> StoreResult<Option<i64>>;

    async fn create_latch(&self, name: &str, count: u64) -> StoreResult<()>;

    /// Returns the remaining count, or `None` if the latch does not exist.
    async fn count_down(&self, name: &str) -> StoreResult<Option<u64>>;

    async fn checkpoint_put(&self, map: &str, key: &str, value: String) -> StoreResult<()>;

    async fn checkpoint_get(&self, map: &str, key: &str) -> StoreResult<Option<String>>;

    async fn object_names(&self, kind: ObjectKind) -> StoreResult<Vec<String>>;

    /// Destroys the named object. Returns whether it existed.
    async fn destroy(&self, kind: ObjectKind, name: &str) -> StoreResult<bool>;
}

/// Cluster membership as seen from one node.
pub trait Membership: Send + Sync {
    fn local_node(&self) -> NodeId;

    fn members(&self) -> Vec<NodeId>;

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent>;
}
