//! A local cache-and-synchronization store for a remote data service.
//!
//! Reads are served from a durable backing cache and refreshed from the
//! remote service when a [`FreshnessPolicy`] says the cache is not enough.
//! Nested remote representations are imported without ever duplicating an
//! object's identity, and local inserts, updates and deletes are sent back
//! and reconciled into the cache.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use incstore::*;
//! # async fn demo(transport: Arc<dyn Transport>) -> StoreResult<()> {
//! let schema = Schema::new().with_entity(EntityDescription::new("user").attribute("name"));
//! let config = StoreConfig::new(Freshness::NonEmpty);
//! let store = IncrementalStore::builder(schema, Arc::new(MemoryStorage::new()), transport, config).build()?;
//!
//! let context = store.context();
//! let users = context.fetch(FetchRequest::new("user")).await?;
//! for identity in users.data {
//!   println!("{:?}", context.read_row(identity)?.attribute("name"));
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod error;
pub mod events;
pub mod fetch;
pub mod identity;
pub mod importer;
pub mod operation;
pub mod policy;
pub mod query;
pub mod queue;
pub mod representation;
pub mod save;
pub mod schema;
pub mod store;
pub mod transport;

pub use cache::{
  BackingCache, CacheResult, CacheRow, CacheSource, MemoryStorage, RelationshipValue, RowStorage,
  SqliteStorage,
};
pub use error::{MutationFailure, StoreError, StoreResult};
pub use events::{ContextId, Outcome, StoreEvent, StoreObserver, Subscription};
pub use fetch::{FetchPhase, RelatedObjects};
pub use identity::{IdentityMap, ObjectIdentity, ResourceIdentifier, ResourceKey};
pub use operation::Operation;
pub use policy::{Freshness, FreshnessPolicy, StoreConfig, UpdatePayload};
pub use query::{FetchRequest, Predicate, SortDescriptor};
pub use representation::Representation;
pub use save::{
  ChangeSet, MutationKind, MutationOutcome, PendingMutation, RelationshipChange, SaveReport,
};
pub use schema::{Cardinality, EntityDescription, RelationshipDescription, Schema};
pub use store::{Context, IncrementalStore, StoreBuilder};
pub use transport::{RemoteOperation, RestTransport, Transport, TransportError, TransportErrorKind};
