//! Backing cache: identity-addressed rows over a storage backend.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use super::storage::{RowStorage, RowWrite};
use super::traits::CacheRow;
use crate::error::{StoreError, StoreResult};
use crate::identity::{IdentityMap, ObjectIdentity, ResourceKey};
use crate::query::FetchRequest;

/// Rows addressed by object identity.
///
/// Thin wrapper around a [`RowStorage`]; it owns the mapping from identities
/// to row keys. Every write goes through a [`CacheTransaction`], so a failed
/// batch leaves nothing behind.
#[derive(Clone)]
pub struct BackingCache {
  storage: Arc<dyn RowStorage>,
  identities: Arc<RwLock<IdentityMap>>,
}

impl BackingCache {
  pub fn new(storage: Arc<dyn RowStorage>, identities: Arc<RwLock<IdentityMap>>) -> Self {
    Self {
      storage,
      identities,
    }
  }

  // A poisoned map is still consistent: every mutation completes before it can panic
  pub(crate) fn identities(&self) -> RwLockReadGuard<'_, IdentityMap> {
    self.identities.read().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn identities_mut(&self) -> RwLockWriteGuard<'_, IdentityMap> {
    self.identities.write().unwrap_or_else(|e| e.into_inner())
  }

  pub fn key_for(&self, identity: ObjectIdentity) -> StoreResult<ResourceKey> {
    self.identities().lookup(identity)
  }

  pub fn read_row(&self, identity: ObjectIdentity) -> StoreResult<CacheRow> {
    let key = self.key_for(identity)?;
    self
      .storage
      .read_row(&key)?
      .ok_or(StoreError::NotFound(identity))
  }

  pub fn find_row(&self, key: &ResourceKey) -> StoreResult<Option<CacheRow>> {
    Ok(self.storage.read_row(key)?)
  }

  /// Upsert the row for `identity`. The row is re-keyed to the identity's pair.
  pub fn write_row(&self, identity: ObjectIdentity, mut row: CacheRow) -> StoreResult<()> {
    let key = self.key_for(identity)?;
    row.entity = key.entity;
    row.resource_identifier = key.resource_identifier;

    let mut tx = self.transaction();
    tx.stage(row);
    tx.commit()
  }

  pub fn delete_row(&self, identity: ObjectIdentity) -> StoreResult<()> {
    let key = self.key_for(identity)?;
    let mut tx = self.transaction();
    tx.delete(key);
    tx.commit()
  }

  /// Purely local query; never touches the network.
  pub fn query(&self, request: &FetchRequest) -> StoreResult<Vec<CacheRow>> {
    Ok(self.storage.query(request)?)
  }

  pub fn last_fetched(&self, request: &FetchRequest) -> StoreResult<Option<DateTime<Utc>>> {
    Ok(self.storage.last_fetched(&request.cache_key())?)
  }

  pub fn transaction(&self) -> CacheTransaction<'_> {
    CacheTransaction {
      cache: self,
      staged: BTreeMap::new(),
      fetched: Vec::new(),
    }
  }
}

/// Scoped batch of cache writes.
///
/// Reads through the transaction see staged rows first. Nothing reaches
/// storage until [`commit`](Self::commit); dropping the transaction discards it.
pub struct CacheTransaction<'a> {
  cache: &'a BackingCache,
  /// `None` marks a staged delete
  staged: BTreeMap<ResourceKey, Option<CacheRow>>,
  fetched: Vec<RowWrite>,
}

impl CacheTransaction<'_> {
  pub fn row(&self, key: &ResourceKey) -> StoreResult<Option<CacheRow>> {
    match self.staged.get(key) {
      Some(staged) => Ok(staged.clone()),
      None => self.cache.find_row(key),
    }
  }

  pub fn stage(&mut self, row: CacheRow) {
    let key = ResourceKey::new(row.entity.clone(), row.resource_identifier.clone());
    self.staged.insert(key, Some(row));
  }

  pub fn delete(&mut self, key: ResourceKey) {
    self.staged.insert(key, None);
  }

  pub fn mark_fetched(&mut self, request: &FetchRequest) {
    self.fetched.push(RowWrite::MarkFetched {
      key: request.cache_key(),
      description: request.to_string(),
      entity: request.entity.clone(),
      at: Utc::now(),
    });
  }

  pub fn is_empty(&self) -> bool {
    self.staged.is_empty() && self.fetched.is_empty()
  }

  pub fn commit(self) -> StoreResult<()> {
    if self.is_empty() {
      return Ok(());
    }

    let mut writes: Vec<RowWrite> = self
      .staged
      .into_iter()
      .map(|(key, row)| match row {
        Some(row) => RowWrite::Upsert(row),
        None => RowWrite::Delete(key),
      })
      .collect();
    writes.extend(self.fetched);

    self
      .cache
      .storage
      .write_batch(&writes)
      .map_err(StoreError::CacheWriteFailed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::identity::ResourceIdentifier;
  use serde_json::json;

  fn cache() -> BackingCache {
    BackingCache::new(
      Arc::new(MemoryStorage::new()),
      Arc::new(RwLock::new(IdentityMap::new())),
    )
  }

  #[test]
  fn test_write_read_delete_by_identity() {
    let cache = cache();
    let identity = cache
      .identities_mut()
      .resolve("user", &ResourceIdentifier::from("1"));

    let mut row = CacheRow::new("ignored", "ignored".into());
    row.attributes.insert("name".into(), json!("Ann"));
    cache.write_row(identity, row).unwrap();

    let row = cache.read_row(identity).unwrap();
    assert_eq!(row.entity, "user");
    assert_eq!(row.resource_identifier.as_str(), "1");

    cache.delete_row(identity).unwrap();
    assert!(matches!(cache.read_row(identity), Err(StoreError::NotFound(_))));
  }

  #[test]
  fn test_transaction_reads_staged_rows_and_discards_on_drop() {
    let cache = cache();
    let key = ResourceKey::new("user", "1".into());
    {
      let mut tx = cache.transaction();
      tx.stage(CacheRow::new("user", "1".into()));
      assert!(tx.row(&key).unwrap().is_some());
      tx.delete(key.clone());
      assert!(tx.row(&key).unwrap().is_none());
      tx.stage(CacheRow::new("user", "1".into()));
    }
    assert!(cache.find_row(&key).unwrap().is_none());

    let mut tx = cache.transaction();
    tx.stage(CacheRow::new("user", "1".into()));
    tx.commit().unwrap();
    assert!(cache.find_row(&key).unwrap().is_some());
  }
}
