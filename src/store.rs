//! The cache session and its logical contexts.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::cache::{BackingCache, CacheResult, CacheRow, RowStorage};
use crate::error::{StoreError, StoreResult};
use crate::events::{ContextId, Observers, Outcome, StoreEvent, StoreObserver, Subscription};
use crate::fetch::{self, RelatedObjects};
use crate::identity::{IdentityMap, ObjectIdentity, ResourceIdentifier, ResourceKey};
use crate::operation::Operation;
use crate::policy::{FreshnessPolicy, StoreConfig};
use crate::query::FetchRequest;
use crate::queue::WorkQueue;
use crate::save::{self, ChangeSet, PendingMutation, SaveReport};
use crate::schema::Schema;
use crate::transport::{RemoteOperation, Transport};

pub(crate) struct StoreInner {
  pub(crate) schema: Arc<Schema>,
  pub(crate) cache: BackingCache,
  pub(crate) transport: Arc<dyn Transport>,
  pub(crate) observers: Observers,
  pub(crate) queue: WorkQueue,
  pub(crate) in_flight: Semaphore,
  pub(crate) policy: Arc<dyn FreshnessPolicy>,
  pub(crate) config: StoreConfig,
  next_context: AtomicU64,
}

impl StoreInner {
  /// Send one remote operation, bracketed by lifecycle events.
  ///
  /// Waits for an in-flight slot first. Cancellation before the transport
  /// call resolves abandons the call.
  pub(crate) async fn remote(
    &self,
    context: ContextId,
    operation: RemoteOperation,
    token: &CancellationToken,
  ) -> StoreResult<Value> {
    let _permit = tokio::select! {
      biased;
      _ = token.cancelled() => return Err(StoreError::Cancelled),
      permit = self.in_flight.acquire() => permit.map_err(|_| StoreError::QueueClosed)?,
    };

    self.observers.publish(StoreEvent::Started {
      context,
      operation: operation.clone(),
    });

    let response = tokio::select! {
      biased;
      _ = token.cancelled() => None,
      response = self.transport.request(&operation) => Some(response),
    };

    let (outcome, result) = match response {
      None => (Outcome::Cancelled, Err(StoreError::Cancelled)),
      Some(Ok(body)) => (Outcome::Succeeded, Ok(body)),
      Some(Err(e)) => (Outcome::Failed(e.clone()), Err(StoreError::Transport(e))),
    };

    self.observers.publish(StoreEvent::Finished {
      context,
      operation,
      outcome,
    });
    result
  }

  /// Identities for rows, registering any not seen in this session yet.
  pub(crate) async fn identities_for(
    &self,
    rows: Vec<CacheRow>,
  ) -> StoreResult<Vec<ObjectIdentity>> {
    let cache = self.cache.clone();
    self
      .queue
      .perform(move || {
        let mut identities = cache.identities_mut();
        rows
          .iter()
          .map(|row| identities.resolve(&row.entity, &row.resource_identifier))
          .collect()
      })
      .await
  }
}

/// Assembles an [`IncrementalStore`].
pub struct StoreBuilder {
  schema: Schema,
  storage: Arc<dyn RowStorage>,
  transport: Arc<dyn Transport>,
  config: StoreConfig,
  policy: Option<Arc<dyn FreshnessPolicy>>,
}

impl StoreBuilder {
  /// Replace the configured built-in freshness policy.
  pub fn policy(mut self, policy: impl FreshnessPolicy + 'static) -> Self {
    self.policy = Some(Arc::new(policy));
    self
  }

  /// Validates the schema and spawns the work queue thread.
  pub fn build(self) -> StoreResult<IncrementalStore> {
    self.schema.validate()?;

    let identities = Arc::new(RwLock::new(IdentityMap::new()));
    let cache = BackingCache::new(self.storage, identities);
    let policy = self
      .policy
      .unwrap_or_else(|| Arc::new(self.config.fetch.freshness) as Arc<dyn FreshnessPolicy>);

    let inner = StoreInner {
      schema: Arc::new(self.schema),
      cache,
      transport: self.transport,
      observers: Observers::new(),
      queue: WorkQueue::new("incstore-queue")?,
      in_flight: Semaphore::new(self.config.fetch.max_in_flight.max(1)),
      policy,
      config: self.config,
      next_context: AtomicU64::new(1),
    };

    Ok(IncrementalStore {
      inner: Arc::new(inner),
    })
  }
}

/// One long-lived cache session: the identity map, the backing cache and
/// the transport, shared by every [`Context`] it hands out.
#[derive(Clone)]
pub struct IncrementalStore {
  inner: Arc<StoreInner>,
}

impl IncrementalStore {
  pub fn builder(
    schema: Schema,
    storage: Arc<dyn RowStorage>,
    transport: Arc<dyn Transport>,
    config: StoreConfig,
  ) -> StoreBuilder {
    StoreBuilder {
      schema,
      storage,
      transport,
      config,
      policy: None,
    }
  }

  /// A new independent logical context.
  pub fn context(&self) -> Context {
    let id = ContextId(self.inner.next_context.fetch_add(1, Ordering::Relaxed));
    Context {
      store: self.clone(),
      id,
      saving: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn schema(&self) -> &Schema {
    &self.inner.schema
  }

  pub fn config(&self) -> &StoreConfig {
    &self.inner.config
  }

  pub fn subscribe(&self, observer: impl StoreObserver + 'static) -> Subscription {
    self.inner.observers.subscribe(observer)
  }

  pub fn unsubscribe(&self, subscription: Subscription) -> bool {
    self.inner.observers.unsubscribe(subscription)
  }

  /// The identity for a pair, registering it if new. Never fails.
  pub fn resolve_identity(
    &self,
    entity: &str,
    resource_identifier: &ResourceIdentifier,
  ) -> ObjectIdentity {
    self
      .inner
      .cache
      .identities_mut()
      .resolve(entity, resource_identifier)
  }

  pub fn lookup_identity(&self, identity: ObjectIdentity) -> StoreResult<ResourceKey> {
    self.inner.cache.key_for(identity)
  }

  pub fn is_placeholder(&self, identity: ObjectIdentity) -> StoreResult<bool> {
    self.inner.cache.identities().is_placeholder(identity)
  }

  pub fn read_row(&self, identity: ObjectIdentity) -> StoreResult<CacheRow> {
    self.inner.cache.read_row(identity)
  }

  /// Purely local query; never touches the network.
  pub fn query_local(&self, request: &FetchRequest) -> StoreResult<Vec<CacheRow>> {
    self.inner.schema.entity(&request.entity)?;
    self.inner.cache.query(request)
  }
}

/// A logical working session over a store.
///
/// Contexts share the identity map and cache but each carries its own id in
/// lifecycle events and its own save reentrancy flag.
#[derive(Clone)]
pub struct Context {
  store: IncrementalStore,
  id: ContextId,
  saving: Arc<AtomicBool>,
}

impl Context {
  pub fn id(&self) -> ContextId {
    self.id
  }

  pub fn store(&self) -> &IncrementalStore {
    &self.store
  }

  /// Identities matching the request, refreshed remotely when the freshness
  /// policy finds the cached rows insufficient.
  pub fn fetch(&self, request: FetchRequest) -> Operation<CacheResult<Vec<ObjectIdentity>>> {
    let token = CancellationToken::new();
    let work = fetch::run_fetch(self.store.inner.clone(), self.id, request, token.clone());
    Operation::spawn(token, work)
  }

  /// Targets of a relationship, fetched remotely when not cached.
  pub fn relationship_value(
    &self,
    identity: ObjectIdentity,
    relationship: &str,
  ) -> Operation<CacheResult<RelatedObjects>> {
    let token = CancellationToken::new();
    let work = fetch::run_relationship(
      self.store.inner.clone(),
      self.id,
      identity,
      relationship.to_string(),
      token.clone(),
    );
    Operation::spawn(token, work)
  }

  /// Create a local object under a placeholder identity. The returned
  /// mutation sends it on the next [`save`](Self::save).
  pub async fn insert(&self, entity: &str, changes: ChangeSet) -> StoreResult<PendingMutation> {
    let inner = self.store.inner.clone();
    let entity = entity.to_string();
    self
      .store
      .inner
      .queue
      .perform(move || save::stage_insert(&inner, &entity, changes))
      .await?
  }

  /// Send a batch of mutations and reconcile the responses.
  ///
  /// Each mutation is final once the remote service confirms it; a failure
  /// never rolls back its siblings. Fails with [`StoreError::ReentrantSave`]
  /// while another save of this context is active.
  pub fn save(&self, batch: Vec<PendingMutation>) -> Operation<SaveReport> {
    let guard = match SaveGuard::acquire(&self.saving, self.id) {
      Ok(guard) => guard,
      Err(e) => return Operation::ready(Err(e)),
    };

    let token = CancellationToken::new();
    let inner = self.store.inner.clone();
    let context = self.id;
    let cancel = token.clone();
    Operation::spawn(token, async move {
      let _guard = guard;
      save::run_save(inner, context, batch, cancel).await
    })
  }

  pub fn read_row(&self, identity: ObjectIdentity) -> StoreResult<CacheRow> {
    self.store.read_row(identity)
  }

  pub fn is_saving(&self) -> bool {
    self.saving.load(Ordering::Acquire)
  }
}

/// Holds a context's save flag; clears it when dropped.
struct SaveGuard {
  flag: Arc<AtomicBool>,
}

impl SaveGuard {
  fn acquire(flag: &Arc<AtomicBool>, context: ContextId) -> StoreResult<Self> {
    flag
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .map_err(|_| StoreError::ReentrantSave(context.as_u64()))?;
    Ok(Self { flag: flag.clone() })
  }
}

impl Drop for SaveGuard {
  fn drop(&mut self) {
    self.flag.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_save_guard_is_exclusive_and_released_on_drop() {
    let flag = Arc::new(AtomicBool::new(false));
    let context = ContextId(1);

    let guard = SaveGuard::acquire(&flag, context).unwrap();
    assert!(matches!(
      SaveGuard::acquire(&flag, context),
      Err(StoreError::ReentrantSave(1))
    ));
    drop(guard);
    assert!(SaveGuard::acquire(&flag, context).is_ok());
  }
}
