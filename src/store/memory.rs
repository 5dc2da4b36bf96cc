//! In-Process Store Backend
//!
//! A single-process stand-in for the replicated store. Several logical nodes share one
//! `MemoryCluster`; each node gets a `MemoryNode` view that knows which partitions it owns.
//!
//! ## Behaviour reproduced from a real partitioned store
//! - **Partition ownership**: keys hash into partitions, partitions are assigned to live members.
//!   A member joining or leaving moves partitions around.
//! - **Local notifications**: a change to a key is delivered only to subscribers on the node that
//!   currently owns the key's partition.
//! - **Versions**: every write bumps the entry version, enabling compare-and-swap.
//! - **TTL**: expired entries are invisible to reads; `sweep_expired` removes them and emits
//!   `Evicted` events.
//! - **Locks**: per-key, token based, with timed waits.

use super::partitioner::PartitionManager;
use super::types::*;
use super::{
    ClusterObjects, EntryMap, Membership, Predicate, StoreError, StoreResult, Topics,
};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const TOPIC_CAPACITY: usize = 1024;
const MEMBERSHIP_CAPACITY: usize = 256;

/// Shared state of an in-process cluster.
pub struct MemoryCluster {
    members: Arc<DashMap<NodeId, ()>>,
    partitioner: Arc<PartitionManager>,
    registry: DashMap<String, Arc<dyn Any + Send + Sync>>,
    sweepers: DashMap<String, Arc<dyn Sweep>>,
    objects: Arc<MemoryObjects>,
    membership_events: broadcast::Sender<MembershipEvent>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Self::with_partitions(super::partitioner::DEFAULT_PARTITION_COUNT)
    }

    pub fn with_partitions(num_partitions: u32) -> Arc<Self> {
        let members = Arc::new(DashMap::new());
        let partitioner = Arc::new(PartitionManager::with_partitions(
            members.clone(),
            num_partitions,
        ));
        let (membership_events, _) = broadcast::channel(MEMBERSHIP_CAPACITY);

        Arc::new(Self {
            members,
            partitioner,
            registry: DashMap::new(),
            sweepers: DashMap::new(),
            objects: Arc::new(MemoryObjects::default()),
            membership_events,
        })
    }

    /// Adds a member and returns its view of the cluster.
    pub fn join(self: &Arc<Self>, node: NodeId) -> MemoryNode {
        if self.members.insert(node.clone(), ()).is_none() {
            tracing::info!(node = %node, members = self.members.len(), "member joined");
            let _ = self
                .membership_events
                .send(MembershipEvent::MemberAdded(node.clone()));
        }

        MemoryNode {
            cluster: self.clone(),
            node,
        }
    }

    /// Removes a member. Its partitions migrate to the remaining members.
    pub fn leave(&self, node: &NodeId) {
        if self.members.remove(node).is_some() {
            tracing::info!(node = %node, members = self.members.len(), "member left");
            let _ = self
                .membership_events
                .send(MembershipEvent::MemberRemoved(node.clone()));
        }
    }

    pub fn connect_client(&self, client: &str) {
        let _ = self
            .membership_events
            .send(MembershipEvent::ClientConnected(client.to_string()));
    }

    pub fn disconnect_client(&self, client: &str) {
        let _ = self
            .membership_events
            .send(MembershipEvent::ClientDisconnected(client.to_string()));
    }

    pub fn members(&self) -> Vec<NodeId> {
        let mut members: Vec<NodeId> = self.members.iter().map(|m| m.key().clone()).collect();
        members.sort();
        members
    }

    pub fn partitioner(&self) -> &PartitionManager {
        &self.partitioner
    }

    /// Removes every expired entry from every map. Returns the number of evictions.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let sweepers: Vec<Arc<dyn Sweep>> =
            self.sweepers.iter().map(|s| s.value().clone()).collect();
        sweepers.iter().map(|sweeper| sweeper.sweep(now)).sum()
    }

    /// Runs `sweep_expired` every `period` until the handle is aborted.
    pub fn spawn_evictor(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cluster = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let evicted = cluster.sweep_expired();
                if evicted > 0 {
                    tracing::debug!(evicted, "evicted expired entries");
                }
            }
        })
    }

    fn shared<T: Any + Send + Sync>(
        &self,
        name: &str,
        init: impl FnOnce() -> Arc<T>,
    ) -> StoreResult<Arc<T>> {
        let erased = self
            .registry
            .entry(name.to_string())
            .or_insert_with(|| init() as Arc<dyn Any + Send + Sync>)
            .value()
            .clone();

        erased
            .downcast::<T>()
            .map_err(|_| StoreError::TypeMismatch(name.to_string()))
    }

    fn shared_map<V>(&self, name: &str) -> StoreResult<Arc<SharedMap<V>>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let map = self.shared::<SharedMap<V>>(&format!("map:{name}"), || {
            Arc::new(SharedMap::<V>::new(name, self.partitioner.clone()))
        })?;
        self.sweepers
            .entry(name.to_string())
            .or_insert_with(|| map.clone() as Arc<dyn Sweep>);
        Ok(map)
    }
}

/// One member's view of a `MemoryCluster`.
#[derive(Clone)]
pub struct MemoryNode {
    cluster: Arc<MemoryCluster>,
    node: NodeId,
}

impl MemoryNode {
    pub fn node_id(&self) -> &NodeId {
        &self.node
    }

    pub fn cluster(&self) -> &Arc<MemoryCluster> {
        &self.cluster
    }

    pub fn map<V>(&self, name: &str) -> StoreResult<Arc<dyn EntryMap<V>>>
    where
        V: Clone + Send + Sync + 'static,
    {
        let shared = self.cluster.shared_map::<V>(name)?;
        let map: Arc<dyn EntryMap<V>> = Arc::new(MemoryMap {
            shared,
            node: self.node.clone(),
        });
        Ok(map)
    }

    pub fn topics<M>(&self) -> StoreResult<Arc<dyn Topics<M>>>
    where
        M: Clone + Send + Sync + 'static,
    {
        let name = format!("topics:{}", std::any::type_name::<M>());
        let topics = self
            .cluster
            .shared::<MemoryTopics<M>>(&name, || Arc::new(MemoryTopics::default()))?;
        let topics: Arc<dyn Topics<M>> = topics;
        Ok(topics)
    }

    pub fn objects(&self) -> Arc<dyn ClusterObjects> {
        self.cluster.objects.clone()
    }

    pub fn membership(&self) -> Arc<dyn Membership> {
        Arc::new(MemoryMembership {
            cluster: self.cluster.clone(),
            node: self.node.clone(),
        })
    }
}

// --- Entry maps ---

#[derive(Debug, Clone)]
struct StoredEntry<V> {
    value: V,
    version: u64,
    expires_at: Option<Instant>,
}

impl<V> StoredEntry<V> {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

trait Sweep: Send + Sync {
    fn sweep(&self, now: Instant) -> usize;
}

struct SharedMap<V> {
    name: String,
    partitioner: Arc<PartitionManager>,
    /// Structure: `Partition ID -> Key -> Entry`.
    data: DashMap<u32, DashMap<String, StoredEntry<V>>>,
    versions: AtomicU64,
    locks: DashMap<String, LockToken>,
    lock_released: Notify,
    subscribers: DashMap<NodeId, Vec<mpsc::UnboundedSender<EntryEvent<V>>>>,
}

impl<V> SharedMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn new(name: &str, partitioner: Arc<PartitionManager>) -> Self {
        let data = DashMap::new();
        for partition in 0..partitioner.num_partitions {
            data.insert(partition, DashMap::new());
        }

        Self {
            name: name.to_string(),
            partitioner,
            data,
            versions: AtomicU64::new(0),
            locks: DashMap::new(),
            lock_released: Notify::new(),
            subscribers: DashMap::new(),
        }
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn with_partition<R>(
        &self,
        key: &str,
        f: impl FnOnce(&DashMap<String, StoredEntry<V>>) -> R,
    ) -> R {
        let partition = self.partitioner.get_partition(key);
        let partition_map = match self.data.get(&partition) {
            Some(partition_map) => partition_map,
            None => self.data.entry(partition).or_default().downgrade(),
        };
        f(&partition_map)
    }

    /// Delivers `event` to the subscribers on the node owning the key.
    fn notify(&self, event: EntryEvent<V>) {
        let Some(owner) = self.partitioner.owner_of(event.key()) else {
            return;
        };

        if let Some(mut senders) = self.subscribers.get_mut(&owner) {
            senders.retain(|sender| sender.send(event.clone()).is_ok());
        }
    }

    fn resolve_expiry(
        expiry: Expiry,
        current: Option<&StoredEntry<V>>,
        now: Instant,
    ) -> Option<Instant> {
        match expiry {
            Expiry::Never => None,
            Expiry::After(ttl) => Some(now + ttl),
            Expiry::Keep => current.and_then(|entry| entry.expires_at),
        }
    }

    fn get(&self, key: &str) -> Option<Versioned<V>> {
        let now = Instant::now();
        self.with_partition(key, |map| {
            map.get(key)
                .filter(|entry| entry.is_live(now))
                .map(|entry| Versioned::new(entry.version, entry.value.clone()))
        })
    }

    /// Core write path. `accept` decides, given the live current entry, whether the write goes ahead.
    fn write(
        &self,
        key: &str,
        value: V,
        expiry: Expiry,
        accept: impl FnOnce(Option<&StoredEntry<V>>) -> bool,
    ) -> Option<u64> {
        let now = Instant::now();
        let (version, event) = self.with_partition(key, |map| match map.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = occupied.get().is_live(now);
                let current = live.then(|| occupied.get());
                if !accept(current) {
                    return (None, None);
                }

                let expires_at = Self::resolve_expiry(expiry, current, now);
                let version = self.next_version();
                let old = occupied.insert(StoredEntry {
                    value: value.clone(),
                    version,
                    expires_at,
                });
                let stored = Versioned::new(version, value);
                let event = if live {
                    EntryEvent::Updated {
                        key: key.to_string(),
                        old: old.value,
                        value: stored,
                    }
                } else {
                    EntryEvent::Added {
                        key: key.to_string(),
                        value: stored,
                    }
                };
                (Some(version), Some(event))
            }
            Entry::Vacant(vacant) => {
                if !accept(None) {
                    return (None, None);
                }

                let version = self.next_version();
                vacant.insert(StoredEntry {
                    value: value.clone(),
                    version,
                    expires_at: Self::resolve_expiry(expiry, None, now),
                });
                let event = EntryEvent::Added {
                    key: key.to_string(),
                    value: Versioned::new(version, value),
                };
                (Some(version), Some(event))
            }
        });

        if let Some(event) = event {
            self.notify(event);
        }
        version
    }

    fn remove(&self, key: &str, expected: Option<u64>) -> Option<V> {
        let now = Instant::now();
        let removed = self.with_partition(key, |map| {
            map.remove_if(key, |_, entry| {
                expected.is_none_or(|version| entry.version == version)
            })
        });

        let (key, entry) = removed?;
        if entry.is_live(now) {
            self.notify(EntryEvent::Removed {
                key,
                old: entry.value.clone(),
            });
            Some(entry.value)
        } else {
            self.notify(EntryEvent::Evicted {
                key,
                old: entry.value,
            });
            None
        }
    }

    fn try_acquire(&self, key: &str) -> Option<LockToken> {
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                let token = LockToken::new();
                vacant.insert(token.clone());
                Some(token)
            }
        }
    }

    async fn lock(&self, key: &str, timeout: Duration) -> Option<LockToken> {
        let acquire = async {
            loop {
                let notified = self.lock_released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(token) = self.try_acquire(key) {
                    return token;
                }
                notified.await;
            }
        };

        tokio::time::timeout(timeout, acquire).await.ok()
    }

    fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()> {
        if self.locks.remove_if(key, |_, held| held == token).is_some() {
            self.lock_released.notify_waiters();
            Ok(())
        } else {
            Err(StoreError::LockNotHeld {
                map: self.name.clone(),
                key: key.to_string(),
            })
        }
    }

    fn query(&self, predicate: Predicate<'_, V>) -> Vec<(String, Versioned<V>)> {
        let now = Instant::now();
        let mut matches = Vec::new();
        for partition in self.data.iter() {
            for entry in partition.value().iter() {
                if entry.is_live(now) && predicate(&entry.value) {
                    matches.push((
                        entry.key().clone(),
                        Versioned::new(entry.version, entry.value.clone()),
                    ));
                }
            }
        }
        matches
    }

    fn local_keys(&self, node: &NodeId) -> Vec<String> {
        let now = Instant::now();
        let mut keys = Vec::new();
        for partition in self.partitioner.primary_partitions(node) {
            if let Some(partition_map) = self.data.get(&partition) {
                keys.extend(
                    partition_map
                        .iter()
                        .filter(|entry| entry.is_live(now))
                        .map(|entry| entry.key().clone()),
                );
            }
        }
        keys
    }

    fn subscribe(&self, node: &NodeId) -> mpsc::UnboundedReceiver<EntryEvent<V>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.entry(node.clone()).or_default().push(sender);
        receiver
    }
}

impl<V> Sweep for SharedMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn sweep(&self, now: Instant) -> usize {
        let mut evicted = Vec::new();
        for partition in self.data.iter() {
            let expired: Vec<String> = partition
                .value()
                .iter()
                .filter(|entry| !entry.is_live(now))
                .map(|entry| entry.key().clone())
                .collect();
            for key in expired {
                if let Some(removed) = partition
                    .value()
                    .remove_if(&key, |_, entry| !entry.is_live(now))
                {
                    evicted.push(removed);
                }
            }
        }

        let count = evicted.len();
        for (key, entry) in evicted {
            tracing::trace!(map = %self.name, key = %key, "entry evicted");
            self.notify(EntryEvent::Evicted {
                key,
                old: entry.value,
            });
        }
        count
    }
}

/// Node-scoped handle on a shared map.
struct MemoryMap<V> {
    shared: Arc<SharedMap<V>>,
    node: NodeId,
}

#[async_trait]
impl<V> EntryMap<V> for MemoryMap<V>
where
    V: Clone + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.shared.name
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Versioned<V>>> {
        Ok(self.shared.get(key))
    }

    async fn put(&self, key: &str, value: V, expiry: Expiry) -> StoreResult<u64> {
        let version = self.shared.write(key, value, expiry, |_| true);
        // An unconditional write always lands.
        Ok(version.unwrap_or_default())
    }

    async fn put_if_absent(&self, key: &str, value: V, expiry: Expiry) -> StoreResult<Option<u64>> {
        Ok(self
            .shared
            .write(key, value, expiry, |current| current.is_none()))
    }

    async fn replace_if_version(
        &self,
        key: &str,
        expected: u64,
        value: V,
        expiry: Expiry,
    ) -> StoreResult<Option<u64>> {
        Ok(self.shared.write(key, value, expiry, |current| {
            current.is_some_and(|entry| entry.version == expected)
        }))
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<V>> {
        Ok(self.shared.remove(key, None))
    }

    async fn remove_if_version(&self, key: &str, expected: u64) -> StoreResult<bool> {
        Ok(self.shared.remove(key, Some(expected)).is_some())
    }

    async fn try_lock(&self, key: &str, timeout: Duration) -> StoreResult<Option<LockToken>> {
        Ok(self.shared.lock(key, timeout).await)
    }

    async fn unlock(&self, key: &str, token: &LockToken) -> StoreResult<()> {
        self.shared.unlock(key, token)
    }

    async fn is_locked(&self, key: &str) -> StoreResult<bool> {
        Ok(self.shared.locks.contains_key(key))
    }

    async fn query(&self, predicate: Predicate<'_, V>) -> StoreResult<Vec<(String, Versioned<V>)>> {
        Ok(self.shared.query(predicate))
    }

    async fn local_keys(&self) -> StoreResult<Vec<String>> {
        Ok(self.shared.local_keys(&self.node))
    }

    fn subscribe_local(&self) -> mpsc::UnboundedReceiver<EntryEvent<V>> {
        self.shared.subscribe(&self.node)
    }
}

// --- Topics ---

struct MemoryTopics<M> {
    channels: DashMap<String, broadcast::Sender<M>>,
    _marker: PhantomData<fn() -> M>,
}

impl<M> Default for MemoryTopics<M> {
    fn default() -> Self {
        Self {
            channels: DashMap::new(),
            _marker: PhantomData,
        }
    }
}

impl<M> MemoryTopics<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn channel(&self, topic: &str) -> broadcast::Sender<M> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .value()
            .clone()
    }
}

#[async_trait]
impl<M> Topics<M> for MemoryTopics<M>
where
    M: Clone + Send + Sync + 'static,
{
    async fn publish(&self, topic: &str, message: M) -> StoreResult<()> {
        let receivers = self.channel(topic).send(message).unwrap_or(0);
        tracing::trace!(topic, receivers, "published message");
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<M> {
        self.channel(topic).subscribe()
    }
}

// --- Cluster objects ---

#[derive(Default)]
struct MemoryObjects {
    counters: DashMap<String, i64>,
    latches: DashMap<String, u64>,
    checkpoints: DashMap<String, DashMap<String, String>>,
}

#[async_trait]
impl ClusterObjects for MemoryObjects {
    async fn set_counter(&self, name: &str, value: i64) -> StoreResult<()> {
        self.counters.insert(name.to_string(), value);
        Ok(())
    }

    async fn decrement_and_get(&self, name: &str) -> StoreResult<Option<i64>> {
        Ok(self.counters.get_mut(name).map(|mut counter| {
            *counter -= 1;
            *counter
        }))
    }

    async fn create_latch(&self, name: &str, count: u64) -> StoreResult<()> {
        self.latches.insert(name.to_string(), count);
        Ok(())
    }

    async fn count_down(&self, name: &str) -> StoreResult<Option<u64>> {
        Ok(self.latches.get_mut(name).map(|mut latch| {
            *latch = latch.saturating_sub(1);
            *latch
        }))
    }

    async fn checkpoint_put(&self, map: &str, key: &str, value: String) -> StoreResult<()> {
        self.checkpoints
            .entry(map.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn checkpoint_get(&self, map: &str, key: &str) -> StoreResult<Option<String>> {
        Ok(self
            .checkpoints
            .get(map)
            .and_then(|checkpoints| checkpoints.get(key).map(|value| value.value().clone())))
    }

    async fn object_names(&self, kind: ObjectKind) -> StoreResult<Vec<String>> {
        let names = match kind {
            ObjectKind::Counter => self.counters.iter().map(|e| e.key().clone()).collect(),
            ObjectKind::Latch => self.latches.iter().map(|e| e.key().clone()).collect(),
            ObjectKind::CheckpointMap => {
                self.checkpoints.iter().map(|e| e.key().clone()).collect()
            }
        };
        Ok(names)
    }

    async fn destroy(&self, kind: ObjectKind, name: &str) -> StoreResult<bool> {
        let existed = match kind {
            ObjectKind::Counter => self.counters.remove(name).is_some(),
            ObjectKind::Latch => self.latches.remove(name).is_some(),
            ObjectKind::CheckpointMap => self.checkpoints.remove(name).is_some(),
        };
        Ok(existed)
    }
}

// --- Membership ---

struct MemoryMembership {
    cluster: Arc<MemoryCluster>,
    node: NodeId,
}

impl Membership for MemoryMembership {
    fn local_node(&self) -> NodeId {
        self.node.clone()
    }

    fn members(&self) -> Vec<NodeId> {
        self.cluster.members()
    }

    fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.cluster.membership_events.subscribe()
    }
}
