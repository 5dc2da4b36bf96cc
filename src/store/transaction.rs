//! Optimistic single-key transactions.
//!
//! `begin` snapshots the entry, `commit` writes only if nobody touched the entry in between,
//! `rollback` just drops the snapshot. Nothing is locked while the transaction is open.

use super::{EntryMap, Expiry, StoreError, StoreResult, Versioned};

pub struct Transaction<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    map: &'a dyn EntryMap<V>,
    key: String,
    snapshot: Option<Versioned<V>>,
}

impl<'a, V> Transaction<'a, V>
where
    V: Clone + Send + Sync + 'static,
{
    pub async fn begin(map: &'a dyn EntryMap<V>, key: &str) -> StoreResult<Self> {
        let snapshot = map.get(key).await?;
        tracing::trace!(map = map.name(), key, "transaction begin");
        Ok(Self {
            map,
            key: key.to_string(),
            snapshot,
        })
    }

    /// The entry as it was when the transaction began.
    pub fn snapshot(&self) -> Option<&Versioned<V>> {
        self.snapshot.as_ref()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Checks that the snapshot is still the entry at `version`.
    pub fn verify(&self, version: u64) -> StoreResult<()> {
        match &self.snapshot {
            Some(current) if current.version == version => Ok(()),
            _ => Err(self.conflict()),
        }
    }

    /// Writes `value` if the entry is unchanged since `begin`. Returns the new version.
    pub async fn commit(self, value: V, expiry: Expiry) -> StoreResult<u64> {
        let written = match &self.snapshot {
            Some(current) => {
                self.map
                    .replace_if_version(&self.key, current.version, value, expiry)
                    .await?
            }
            None => self.map.put_if_absent(&self.key, value, expiry).await?,
        };

        match written {
            Some(version) => {
                tracing::trace!(map = self.map.name(), key = %self.key, version, "transaction commit");
                Ok(version)
            }
            None => Err(self.conflict()),
        }
    }

    pub fn rollback(self) {
        tracing::trace!(map = self.map.name(), key = %self.key, "transaction rollback");
    }

    fn conflict(&self) -> StoreError {
        StoreError::Conflict {
            map: self.map.name().to_string(),
            key: self.key.clone(),
        }
    }
}
