//! Fetch orchestration and lazy relationship traversal.
//!
//! A fetch moves through `Received → LocalCheck → Satisfied | RemoteInFlight
//! → Importing → Completed | Failed`. Only the import phase runs on the work
//! queue; the remote call suspends without holding it.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{BackingCache, CacheResult, CacheRow, RelationshipValue};
use crate::error::{StoreError, StoreResult};
use crate::events::ContextId;
use crate::identity::{ObjectIdentity, ResourceKey};
use crate::importer::Importer;
use crate::query::FetchRequest;
use crate::representation::representations_from_response;
use crate::schema::{Cardinality, RelationshipDescription};
use crate::store::StoreInner;
use crate::transport::{RemoteOperation, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchPhase {
  Received,
  LocalCheck,
  Satisfied,
  RemoteInFlight,
  Importing,
  Completed,
  Failed,
}

impl fmt::Display for FetchPhase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      FetchPhase::Received => "received",
      FetchPhase::LocalCheck => "local-check",
      FetchPhase::Satisfied => "satisfied",
      FetchPhase::RemoteInFlight => "remote-in-flight",
      FetchPhase::Importing => "importing",
      FetchPhase::Completed => "completed",
      FetchPhase::Failed => "failed",
    };
    f.write_str(s)
  }
}

/// Logs each state transition of one fetch.
struct Phases {
  context: ContextId,
  subject: String,
  current: FetchPhase,
}

impl Phases {
  fn new(context: ContextId, subject: String) -> Self {
    debug!(%context, %subject, phase = %FetchPhase::Received, "fetch phase");
    Self {
      context,
      subject,
      current: FetchPhase::Received,
    }
  }

  fn enter(&mut self, phase: FetchPhase) {
    debug!(
      context = %self.context,
      subject = %self.subject,
      from = %self.current,
      phase = %phase,
      "fetch phase"
    );
    self.current = phase;
  }
}

/// Resolved targets of a relationship.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelatedObjects {
  One(Option<ObjectIdentity>),
  Many(Vec<ObjectIdentity>),
}

impl RelatedObjects {
  pub fn identities(&self) -> Vec<ObjectIdentity> {
    match self {
      RelatedObjects::One(target) => target.iter().copied().collect(),
      RelatedObjects::Many(targets) => targets.clone(),
    }
  }
}

pub(crate) async fn run_fetch(
  inner: Arc<StoreInner>,
  context: ContextId,
  request: FetchRequest,
  token: CancellationToken,
) -> StoreResult<CacheResult<Vec<ObjectIdentity>>> {
  let mut phases = Phases::new(context, request.to_string());
  let result = fetch(&inner, context, &request, &token, &mut phases).await;
  if result.is_err() && phases.current != FetchPhase::Failed {
    phases.enter(FetchPhase::Failed);
  }
  result
}

async fn fetch(
  inner: &Arc<StoreInner>,
  context: ContextId,
  request: &FetchRequest,
  token: &CancellationToken,
  phases: &mut Phases,
) -> StoreResult<CacheResult<Vec<ObjectIdentity>>> {
  inner.schema.entity(&request.entity)?;

  phases.enter(FetchPhase::LocalCheck);
  let local = inner.cache.query(request)?;
  let last_fetched = inner.cache.last_fetched(request)?;
  if inner.policy.is_sufficient(request, &local, last_fetched) {
    phases.enter(FetchPhase::Satisfied);
    let identities = inner.identities_for(local).await?;
    return Ok(CacheResult::from_cache(identities));
  }

  phases.enter(FetchPhase::RemoteInFlight);
  let operation = RemoteOperation::Fetch {
    request: request.clone(),
  };
  let body = match inner.remote(context, operation, token).await {
    Ok(body) => body,
    Err(StoreError::Transport(e)) => return degrade(inner, phases, local, e).await,
    Err(e) => return Err(e),
  };
  if token.is_cancelled() {
    return Err(StoreError::Cancelled);
  }

  phases.enter(FetchPhase::Importing);
  let job_inner = inner.clone();
  let job_request = request.clone();
  let imported = inner
    .queue
    .perform(move || import_response(&job_inner, &job_request, body))
    .await?;

  match imported {
    Ok(identities) => {
      phases.enter(FetchPhase::Completed);
      info!(%context, request = %request, count = identities.len(), "fetch completed");
      Ok(CacheResult::from_network(identities))
    }
    // Unreadable body: same failure path as the call itself
    Err(StoreError::Transport(e)) => degrade(inner, phases, local, e).await,
    Err(e) => Err(e),
  }
}

/// Import a fetch response, record the fetch, then re-run the local query so
/// the result reflects exactly what the cache now holds.
fn import_response(
  inner: &StoreInner,
  request: &FetchRequest,
  body: Value,
) -> StoreResult<Vec<ObjectIdentity>> {
  let description = inner.schema.entity(&request.entity)?;
  let representations = representations_from_response(description, body)?;

  {
    let mut identities = inner.cache.identities_mut();
    let mut tx = inner.cache.transaction();
    Importer::new(&inner.schema, &mut identities, &mut tx)
      .import_all(&representations, &request.entity)?;
    tx.mark_fetched(request);
    tx.commit()?;
  }

  let rows = inner.cache.query(request)?;
  Ok(identities_of(&inner.cache, &rows))
}

fn identities_of(cache: &BackingCache, rows: &[CacheRow]) -> Vec<ObjectIdentity> {
  let mut identities = cache.identities_mut();
  rows
    .iter()
    .map(|row| identities.resolve(&row.entity, &row.resource_identifier))
    .collect()
}

async fn degrade(
  inner: &StoreInner,
  phases: &mut Phases,
  local: Vec<CacheRow>,
  error: TransportError,
) -> StoreResult<CacheResult<Vec<ObjectIdentity>>> {
  phases.enter(FetchPhase::Failed);
  if !inner.config.fetch.degrade_on_failure || local.is_empty() {
    return Err(StoreError::Transport(error));
  }

  warn!(
    subject = %phases.subject,
    %error,
    count = local.len(),
    "serving cached rows after remote failure"
  );
  let identities = inner.identities_for(local).await?;
  Ok(CacheResult::offline(identities, error))
}

pub(crate) async fn run_relationship(
  inner: Arc<StoreInner>,
  context: ContextId,
  identity: ObjectIdentity,
  name: String,
  token: CancellationToken,
) -> StoreResult<CacheResult<RelatedObjects>> {
  let (key, placeholder) = {
    let identities = inner.cache.identities();
    (identities.lookup(identity)?, identities.is_placeholder(identity)?)
  };
  let relationship = inner.schema.relationship(&key.entity, &name)?.clone();
  let row = inner
    .cache
    .find_row(&key)?
    .ok_or(StoreError::NotFound(identity))?;
  let local = row.relationship(&name).cloned();

  let mut phases = Phases::new(context, format!("{}.{}", key, name));
  phases.enter(FetchPhase::LocalCheck);

  if let Some(value) = &local {
    if all_targets_cached(&inner.cache, &relationship.target, value)? {
      phases.enter(FetchPhase::Satisfied);
      let related = related_locally(&inner, &relationship, value.clone()).await?;
      return Ok(CacheResult::from_cache(related));
    }
  }

  // Nothing remote to ask about an object the service has never seen
  if placeholder {
    phases.enter(FetchPhase::Satisfied);
    let value = local.unwrap_or_else(|| empty_value(relationship.cardinality));
    let related = related_locally(&inner, &relationship, value).await?;
    return Ok(CacheResult::from_cache(related));
  }

  phases.enter(FetchPhase::RemoteInFlight);
  let operation = RemoteOperation::FetchRelationship {
    entity: key.entity.clone(),
    resource_identifier: key.resource_identifier.clone(),
    relationship: name.clone(),
  };

  let result = match inner.remote(context, operation, &token).await {
    Ok(_) if token.is_cancelled() => Err(StoreError::Cancelled),
    Ok(body) => {
      phases.enter(FetchPhase::Importing);
      let job_inner = inner.clone();
      let job_relationship = relationship.clone();
      inner
        .queue
        .perform(move || import_relationship(&job_inner, &key, &name, &job_relationship, body))
        .await?
    }
    Err(e) => Err(e),
  };

  match (result, local) {
    (Ok(related), _) => {
      phases.enter(FetchPhase::Completed);
      Ok(CacheResult::from_network(related))
    }
    (Err(StoreError::Transport(error)), Some(value)) if inner.config.fetch.degrade_on_failure => {
      phases.enter(FetchPhase::Failed);
      warn!(subject = %phases.subject, %error, "serving cached relationship after remote failure");
      let related = related_locally(&inner, &relationship, value).await?;
      Ok(CacheResult::offline(related, error))
    }
    (Err(e), _) => {
      phases.enter(FetchPhase::Failed);
      Err(e)
    }
  }
}

fn empty_value(cardinality: Cardinality) -> RelationshipValue {
  match cardinality {
    Cardinality::ToOne => RelationshipValue::ToOne(None),
    Cardinality::ToMany => RelationshipValue::ToMany(Vec::new()),
  }
}

fn all_targets_cached(
  cache: &BackingCache,
  target: &str,
  value: &RelationshipValue,
) -> StoreResult<bool> {
  for resource_identifier in value.identifiers() {
    if cache
      .find_row(&ResourceKey::new(target, resource_identifier))?
      .is_none()
    {
      return Ok(false);
    }
  }
  Ok(true)
}

async fn related_locally(
  inner: &StoreInner,
  relationship: &RelationshipDescription,
  value: RelationshipValue,
) -> StoreResult<RelatedObjects> {
  let cache = inner.cache.clone();
  let target = relationship.target.clone();
  inner
    .queue
    .perform(move || {
      let mut identities = cache.identities_mut();
      match value {
        RelationshipValue::ToOne(rid) => {
          RelatedObjects::One(rid.map(|rid| identities.resolve(&target, &rid)))
        }
        RelationshipValue::ToMany(rids) => RelatedObjects::Many(
          rids
            .iter()
            .map(|rid| identities.resolve(&target, rid))
            .collect(),
        ),
      }
    })
    .await
}

/// Import the targets of a relationship and record them on the source row.
fn import_relationship(
  inner: &StoreInner,
  key: &ResourceKey,
  name: &str,
  relationship: &RelationshipDescription,
  body: Value,
) -> StoreResult<RelatedObjects> {
  let target = inner.schema.entity(&relationship.target)?;
  let representations = representations_from_response(target, body)?;

  if relationship.cardinality == Cardinality::ToOne && representations.len() > 1 {
    return Err(StoreError::CardinalityMismatch {
      entity: key.entity.clone(),
      relationship: name.to_string(),
      expected: relationship.cardinality.describe(),
    });
  }

  let mut identities = inner.cache.identities_mut();
  let mut tx = inner.cache.transaction();
  let imported =
    Importer::new(&inner.schema, &mut identities, &mut tx)
      .import_all(&representations, &relationship.target)?;

  let mut targets = Vec::with_capacity(imported.len());
  let mut related = Vec::with_capacity(imported.len());
  for identity in imported {
    if related.contains(&identity) {
      continue;
    }
    targets.push(identities.lookup(identity)?.resource_identifier);
    related.push(identity);
  }

  let (value, related) = match relationship.cardinality {
    Cardinality::ToOne => (
      RelationshipValue::ToOne(targets.into_iter().next()),
      RelatedObjects::One(related.first().copied()),
    ),
    Cardinality::ToMany => (RelationshipValue::ToMany(targets), RelatedObjects::Many(related)),
  };

  let mut row = tx
    .row(key)?
    .unwrap_or_else(|| CacheRow::new(key.entity.clone(), key.resource_identifier.clone()));
  row.relationships.insert(name.to_string(), value);
  tx.stage(row);
  tx.commit()?;

  Ok(related)
}
