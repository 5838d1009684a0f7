//! Backing cache for imported and locally created rows.
//!
//! This module provides the durable side of the store:
//! - A storage trait with SQLite and in-memory backends
//! - Identity-addressed reads and writes over that storage
//! - Scoped transactions so a failed import never becomes visible
//! - Result metadata saying whether data came from the network or the cache

mod layer;
mod memory;
mod storage;
mod traits;

pub use layer::{BackingCache, CacheTransaction};
pub use memory::MemoryStorage;
pub use storage::{RowStorage, RowWrite, SqliteStorage, StorageError, StorageResult};
pub use traits::{CacheResult, CacheRow, CacheSource, RelationshipValue};
