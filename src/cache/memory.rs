//! In-memory storage backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use super::storage::{RowStorage, RowWrite, StorageError, StorageResult};
use super::traits::CacheRow;
use crate::identity::ResourceKey;
use crate::query::{sort_rows, FetchRequest};

#[derive(Default)]
struct MemoryState {
  rows: BTreeMap<ResourceKey, CacheRow>,
  fetch_log: HashMap<String, DateTime<Utc>>,
}

/// Storage that keeps rows in process memory.
/// Nothing survives a restart; useful for tests and throwaway sessions.
#[derive(Default)]
pub struct MemoryStorage {
  state: RwLock<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.state.read().map(|s| s.rows.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StorageError {
  StorageError::LockPoisoned(e.to_string())
}

impl RowStorage for MemoryStorage {
  fn read_row(&self, key: &ResourceKey) -> StorageResult<Option<CacheRow>> {
    let state = self.state.read().map_err(poisoned)?;
    Ok(state.rows.get(key).cloned())
  }

  fn write_batch(&self, writes: &[RowWrite]) -> StorageResult<()> {
    // Whole batch applied under one write lock
    let mut state = self.state.write().map_err(poisoned)?;
    for write in writes {
      match write {
        RowWrite::Upsert(row) => {
          let key = ResourceKey::new(row.entity.clone(), row.resource_identifier.clone());
          state.rows.insert(key, row.clone());
        }
        RowWrite::Delete(key) => {
          state.rows.remove(key);
        }
        RowWrite::MarkFetched { key, at, .. } => {
          state.fetch_log.insert(key.clone(), *at);
        }
      }
    }
    Ok(())
  }

  fn query(&self, request: &FetchRequest) -> StorageResult<Vec<CacheRow>> {
    let state = self.state.read().map_err(poisoned)?;
    let mut rows: Vec<CacheRow> = state
      .rows
      .values()
      .filter(|r| r.entity == request.entity && request.predicate.matches(r))
      .cloned()
      .collect();
    drop(state);

    sort_rows(&mut rows, &request.sort);
    if let Some(limit) = request.limit {
      rows.truncate(limit);
    }
    Ok(rows)
  }

  fn last_fetched(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
    let state = self.state.read().map_err(poisoned)?;
    Ok(state.fetch_log.get(key).copied())
  }
}
