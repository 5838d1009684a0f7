//! Save orchestration: pending mutations, sending them, folding results back.
//!
//! A batch is sent deletes first, then inserts one at a time, then updates.
//! Deletes and updates of one batch are in flight together, bounded by the
//! store's in-flight limit. Inserts go one by one so a later insert can
//! reference an earlier one by its promoted identifier.
//!
//! Each mutation commits on its own once the service confirms it. A batch is
//! never rolled back as a whole: callers get one outcome per mutation, in
//! batch order.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheRow, CacheTransaction, RelationshipValue};
use crate::error::{MutationFailure, StoreError, StoreResult};
use crate::events::ContextId;
use crate::identity::{IdentityMap, ObjectIdentity, ResourceIdentifier, ResourceKey};
use crate::importer::Importer;
use crate::policy::UpdatePayload;
use crate::query::{FetchRequest, Predicate};
use crate::representation::{identifier_of, representations_from_response, Representation};
use crate::schema::{Cardinality, Schema};
use crate::store::StoreInner;
use crate::transport::RemoteOperation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
  Insert,
  Update,
  Delete,
}

impl fmt::Display for MutationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      MutationKind::Insert => "insert",
      MutationKind::Update => "update",
      MutationKind::Delete => "delete",
    };
    f.write_str(s)
  }
}

/// New value of one relationship, by identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationshipChange {
  ToOne(Option<ObjectIdentity>),
  ToMany(Vec<ObjectIdentity>),
}

/// Attribute and relationship values to send.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
  pub attributes: Map<String, Value>,
  pub relationships: BTreeMap<String, RelationshipChange>,
}

impl ChangeSet {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
    self.attributes.insert(attribute.into(), value.into());
    self
  }

  pub fn relate(mut self, relationship: impl Into<String>, target: ObjectIdentity) -> Self {
    self
      .relationships
      .insert(relationship.into(), RelationshipChange::ToOne(Some(target)));
    self
  }

  pub fn unrelate(mut self, relationship: impl Into<String>) -> Self {
    self
      .relationships
      .insert(relationship.into(), RelationshipChange::ToOne(None));
    self
  }

  pub fn relate_many(
    mut self,
    relationship: impl Into<String>,
    targets: Vec<ObjectIdentity>,
  ) -> Self {
    self
      .relationships
      .insert(relationship.into(), RelationshipChange::ToMany(targets));
    self
  }

  pub fn is_empty(&self) -> bool {
    self.attributes.is_empty() && self.relationships.is_empty()
  }
}

/// One local change waiting to be sent.
///
/// Inserts come from [`Context::insert`](crate::Context::insert), which
/// registers the placeholder identity they carry.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingMutation {
  Insert {
    identity: ObjectIdentity,
    changes: ChangeSet,
  },
  Update {
    identity: ObjectIdentity,
    changes: ChangeSet,
  },
  Delete {
    identity: ObjectIdentity,
  },
}

impl PendingMutation {
  pub fn update(identity: ObjectIdentity, changes: ChangeSet) -> Self {
    PendingMutation::Update { identity, changes }
  }

  pub fn delete(identity: ObjectIdentity) -> Self {
    PendingMutation::Delete { identity }
  }

  pub fn identity(&self) -> ObjectIdentity {
    match self {
      PendingMutation::Insert { identity, .. }
      | PendingMutation::Update { identity, .. }
      | PendingMutation::Delete { identity } => *identity,
    }
  }

  pub fn kind(&self) -> MutationKind {
    match self {
      PendingMutation::Insert { .. } => MutationKind::Insert,
      PendingMutation::Update { .. } => MutationKind::Update,
      PendingMutation::Delete { .. } => MutationKind::Delete,
    }
  }
}

#[derive(Debug)]
pub struct MutationOutcome {
  pub identity: ObjectIdentity,
  pub kind: MutationKind,
  pub result: StoreResult<()>,
}

/// Per-mutation outcomes of one save, in batch order.
#[derive(Debug, Default)]
pub struct SaveReport {
  pub outcomes: Vec<MutationOutcome>,
}

impl SaveReport {
  pub fn is_success(&self) -> bool {
    self.outcomes.iter().all(|o| o.result.is_ok())
  }

  pub fn failures(&self) -> impl Iterator<Item = &MutationOutcome> {
    self.outcomes.iter().filter(|o| o.result.is_err())
  }

  /// Collapse into one aggregate error naming every failed mutation.
  pub fn into_result(self) -> StoreResult<()> {
    let failures: Vec<MutationFailure> = self
      .outcomes
      .into_iter()
      .filter_map(|o| match o.result {
        Ok(()) => None,
        Err(error) => Some(MutationFailure {
          identity: o.identity,
          kind: o.kind,
          error,
        }),
      })
      .collect();

    if failures.is_empty() {
      Ok(())
    } else {
      Err(StoreError::SaveFailed(failures))
    }
  }
}

/// Register a placeholder and write its row. Runs on the work queue.
pub(crate) fn stage_insert(
  inner: &StoreInner,
  entity: &str,
  changes: ChangeSet,
) -> StoreResult<PendingMutation> {
  let description = inner.schema.entity(entity)?;
  let mut identities = inner.cache.identities_mut();
  let relationships = resolve_relationships(&inner.schema, entity, &identities, &changes, true)?;

  let identity = identities.register_placeholder(entity);
  let key = identities.lookup(identity)?;

  let mut row = CacheRow::new(entity, key.resource_identifier);
  for (name, value) in &changes.attributes {
    if description.is_attribute(name) {
      row.attributes.insert(name.clone(), value.clone());
    }
  }
  row.relationships = relationships;

  let mut tx = inner.cache.transaction();
  tx.stage(row);
  if let Err(e) = tx.commit() {
    identities.purge(identity);
    return Err(e);
  }

  debug!(entity, %identity, "staged local insert");
  Ok(PendingMutation::Insert { identity, changes })
}

/// Relationship changes as resource identifiers, checked against the schema.
/// Placeholder targets are only allowed when the values stay local.
fn resolve_relationships(
  schema: &Schema,
  entity: &str,
  identities: &IdentityMap,
  changes: &ChangeSet,
  allow_placeholders: bool,
) -> StoreResult<BTreeMap<String, RelationshipValue>> {
  let resolve = |target: ObjectIdentity| -> StoreResult<ResourceIdentifier> {
    if !allow_placeholders && identities.is_placeholder(target)? {
      return Err(StoreError::PlaceholderIdentity(target));
    }
    Ok(identities.lookup(target)?.resource_identifier)
  };

  let mut resolved = BTreeMap::new();
  for (name, change) in &changes.relationships {
    let relationship = schema.relationship(entity, name)?;
    let value = match (relationship.cardinality, change) {
      (Cardinality::ToOne, RelationshipChange::ToOne(target)) => {
        RelationshipValue::ToOne(target.map(resolve).transpose()?)
      }
      (Cardinality::ToMany, RelationshipChange::ToMany(targets)) => RelationshipValue::ToMany(
        targets
          .iter()
          .map(|t| resolve(*t))
          .collect::<StoreResult<_>>()?,
      ),
      (cardinality, _) => {
        return Err(StoreError::CardinalityMismatch {
          entity: entity.to_string(),
          relationship: name.clone(),
          expected: cardinality.describe(),
        })
      }
    };
    resolved.insert(name.clone(), value);
  }
  Ok(resolved)
}

fn relationship_json(value: &RelationshipValue) -> Value {
  match value {
    RelationshipValue::ToOne(Some(rid)) => Value::String(rid.as_str().to_string()),
    RelationshipValue::ToOne(None) => Value::Null,
    RelationshipValue::ToMany(rids) => Value::Array(
      rids
        .iter()
        .map(|rid| Value::String(rid.as_str().to_string()))
        .collect(),
    ),
  }
}

fn wire_payload(
  attributes: &Map<String, Value>,
  relationships: &BTreeMap<String, RelationshipValue>,
) -> Representation {
  let mut payload = attributes.clone();
  for (name, value) in relationships {
    payload.insert(name.clone(), relationship_json(value));
  }
  payload
}

pub(crate) async fn run_save(
  inner: Arc<StoreInner>,
  context: ContextId,
  batch: Vec<PendingMutation>,
  token: CancellationToken,
) -> StoreResult<SaveReport> {
  let total = batch.len();
  info!(%context, mutations = total, "save started");

  let mut deletes = Vec::new();
  let mut inserts = Vec::new();
  let mut updates = Vec::new();
  for (index, mutation) in batch.into_iter().enumerate() {
    match mutation.kind() {
      MutationKind::Delete => deletes.push((index, mutation)),
      MutationKind::Insert => inserts.push((index, mutation)),
      MutationKind::Update => updates.push((index, mutation)),
    }
  }

  let mut outcomes: Vec<Option<MutationOutcome>> = (0..total).map(|_| None).collect();

  let shared = (&inner, &token);
  let sent = join_all(deletes.into_iter().map(|(index, mutation)| async move {
    (index, apply(shared.0, context, mutation, shared.1).await)
  }))
  .await;
  for (index, outcome) in sent {
    outcomes[index] = Some(outcome);
  }

  for (index, mutation) in inserts {
    outcomes[index] = Some(apply(shared.0, context, mutation, shared.1).await);
  }

  let sent = join_all(updates.into_iter().map(|(index, mutation)| async move {
    (index, apply(shared.0, context, mutation, shared.1).await)
  }))
  .await;
  for (index, outcome) in sent {
    outcomes[index] = Some(outcome);
  }

  let report = SaveReport {
    outcomes: outcomes.into_iter().flatten().collect(),
  };
  let failed = report.failures().count();
  info!(%context, mutations = total, failed, "save finished");
  Ok(report)
}

async fn apply(
  inner: &Arc<StoreInner>,
  context: ContextId,
  mutation: PendingMutation,
  token: &CancellationToken,
) -> MutationOutcome {
  let identity = mutation.identity();
  let kind = mutation.kind();

  let result = if token.is_cancelled() {
    Err(StoreError::Cancelled)
  } else {
    match mutation {
      PendingMutation::Insert { identity, changes } => {
        send_insert(inner, context, identity, changes, token).await
      }
      PendingMutation::Update { identity, changes } => {
        send_update(inner, context, identity, changes, token).await
      }
      PendingMutation::Delete { identity } => send_delete(inner, context, identity, token).await,
    }
  };

  match &result {
    Err(error) if error.is_contract_violation() => {
      error!(%context, %identity, %kind, %error, "mutation broke the service contract");
    }
    Err(error) => warn!(%context, %identity, %kind, %error, "mutation failed"),
    Ok(()) => {}
  }
  MutationOutcome {
    identity,
    kind,
    result,
  }
}

async fn send_insert(
  inner: &Arc<StoreInner>,
  context: ContextId,
  identity: ObjectIdentity,
  changes: ChangeSet,
  token: &CancellationToken,
) -> StoreResult<()> {
  let (entity, payload) = {
    let identities = inner.cache.identities();
    let key = identities.lookup(identity)?;
    let relationships =
      resolve_relationships(&inner.schema, &key.entity, &identities, &changes, false)?;
    (key.entity, wire_payload(&changes.attributes, &relationships))
  };

  let operation = RemoteOperation::Insert {
    entity: entity.clone(),
    payload: Value::Object(payload),
  };
  let body = inner.remote(context, operation, token).await?;

  let job_inner = inner.clone();
  inner
    .queue
    .perform(move || reconcile_insert(&job_inner, identity, &entity, body))
    .await?
}

/// Promote the placeholder to the durable identifier, move its row over and
/// merge the confirmed representation into it, all in one transaction.
fn reconcile_insert(
  inner: &StoreInner,
  identity: ObjectIdentity,
  entity: &str,
  body: Value,
) -> StoreResult<()> {
  let description = inner.schema.entity(entity)?;
  let representation = representations_from_response(description, body)?
    .into_iter()
    .next()
    .ok_or_else(|| StoreError::MissingIdentifier {
      entity: entity.to_string(),
      field: description.identifier.clone(),
    })?;
  let resource_identifier = identifier_of(&representation, description)?;

  let mut identities = inner.cache.identities_mut();
  let placeholder = identities.promote(identity, &resource_identifier)?;

  let written = move_and_import(
    inner,
    &mut identities,
    entity,
    placeholder.as_ref(),
    &resource_identifier,
    &representation,
  );

  match (written, placeholder) {
    (Err(e), Some(old)) => {
      identities.revert_promotion(identity, old);
      Err(e)
    }
    (Err(e), None) => Err(e),
    (Ok(()), _) => {
      debug!(entity, %identity, %resource_identifier, "insert confirmed");
      Ok(())
    }
  }
}

fn move_and_import(
  inner: &StoreInner,
  identities: &mut IdentityMap,
  entity: &str,
  placeholder: Option<&ResourceIdentifier>,
  resource_identifier: &ResourceIdentifier,
  representation: &Representation,
) -> StoreResult<()> {
  let mut tx = inner.cache.transaction();
  if let Some(old) = placeholder {
    repoint_references(inner, &mut tx, entity, old, resource_identifier)?;

    let old_key = ResourceKey::new(entity, old.clone());
    if let Some(mut row) = tx.row(&old_key)? {
      tx.delete(old_key);
      row.resource_identifier = resource_identifier.clone();
      tx.stage(row);
    }
  }
  Importer::new(&inner.schema, identities, &mut tx).import(representation, entity)?;
  tx.commit()
}

/// Rewrite every cached row whose relationships name the placeholder so it
/// names the durable identifier instead.
fn repoint_references(
  inner: &StoreInner,
  tx: &mut CacheTransaction<'_>,
  entity: &str,
  old: &ResourceIdentifier,
  new: &ResourceIdentifier,
) -> StoreResult<()> {
  for (source, relationship) in inner.schema.relationships_targeting(entity) {
    let request = FetchRequest::new(source)
      .filter(Predicate::RelatedTo(relationship.to_string(), old.clone()));
    for found in inner.cache.query(&request)? {
      let key = ResourceKey::new(source, found.resource_identifier);
      let Some(mut row) = tx.row(&key)? else {
        continue;
      };
      let changed = row
        .relationships
        .get_mut(relationship)
        .map(|value| value.replace(old, new))
        .unwrap_or(false);
      if changed {
        debug!(%key, relationship, "repointed reference to promoted identity");
        tx.stage(row);
      }
    }
  }
  Ok(())
}

async fn send_update(
  inner: &Arc<StoreInner>,
  context: ContextId,
  identity: ObjectIdentity,
  changes: ChangeSet,
  token: &CancellationToken,
) -> StoreResult<()> {
  let (key, relationships, payload) = {
    let identities = inner.cache.identities();
    if identities.is_placeholder(identity)? {
      return Err(StoreError::PlaceholderIdentity(identity));
    }
    let key = identities.lookup(identity)?;
    let relationships =
      resolve_relationships(&inner.schema, &key.entity, &identities, &changes, false)?;
    let payload = wire_payload(&changes.attributes, &relationships);
    (key, relationships, payload)
  };

  let payload = match inner.config.save.update_payload {
    UpdatePayload::Delta => payload,
    UpdatePayload::Full => full_payload(inner, &key, payload)?,
  };

  let operation = RemoteOperation::Update {
    entity: key.entity.clone(),
    resource_identifier: key.resource_identifier.clone(),
    payload: Value::Object(payload),
  };
  let body = inner.remote(context, operation, token).await?;

  let job_inner = inner.clone();
  let attributes = changes.attributes;
  inner
    .queue
    .perform(move || reconcile_update(&job_inner, &key, body, attributes, relationships))
    .await?
}

/// The cached row with the delta laid over it, plus the identifier field.
fn full_payload(
  inner: &StoreInner,
  key: &ResourceKey,
  delta: Representation,
) -> StoreResult<Representation> {
  let description = inner.schema.entity(&key.entity)?;
  let mut payload = match inner.cache.find_row(key)? {
    Some(row) => wire_payload(&row.attributes, &row.relationships),
    None => Map::new(),
  };
  payload.insert(
    description.identifier.clone(),
    Value::String(key.resource_identifier.as_str().to_string()),
  );
  payload.extend(delta);
  Ok(payload)
}

/// Merge the confirmed representation, or the sent delta when the service
/// answered without one.
fn reconcile_update(
  inner: &StoreInner,
  key: &ResourceKey,
  body: Value,
  attributes: Map<String, Value>,
  relationships: BTreeMap<String, RelationshipValue>,
) -> StoreResult<()> {
  let description = inner.schema.entity(&key.entity)?;
  let confirmed = representations_from_response(description, body)?.into_iter().next();

  let mut identities = inner.cache.identities_mut();
  let mut tx = inner.cache.transaction();
  match confirmed {
    Some(mut representation) => {
      representation
        .entry(description.identifier.clone())
        .or_insert_with(|| Value::String(key.resource_identifier.as_str().to_string()));
      Importer::new(&inner.schema, &mut identities, &mut tx).import(&representation, &key.entity)?;
    }
    None => {
      let mut row = tx
        .row(key)?
        .unwrap_or_else(|| CacheRow::new(key.entity.clone(), key.resource_identifier.clone()));
      for (name, value) in attributes {
        if description.is_attribute(&name) {
          row.attributes.insert(name, value);
        }
      }
      row.relationships.extend(relationships);
      row.cached_at = chrono::Utc::now();
      tx.stage(row);
    }
  }
  tx.commit()
}

async fn send_delete(
  inner: &Arc<StoreInner>,
  context: ContextId,
  identity: ObjectIdentity,
  token: &CancellationToken,
) -> StoreResult<()> {
  let (key, placeholder) = {
    let identities = inner.cache.identities();
    (identities.lookup(identity)?, identities.is_placeholder(identity)?)
  };

  // Never synced: nothing to delete remotely
  if !placeholder {
    let operation = RemoteOperation::Delete {
      entity: key.entity.clone(),
      resource_identifier: key.resource_identifier.clone(),
    };
    inner.remote(context, operation, token).await?;
  }

  let job_inner = inner.clone();
  inner
    .queue
    .perform(move || {
      let mut tx = job_inner.cache.transaction();
      tx.delete(key);
      tx.commit()?;
      job_inner.cache.identities_mut().purge(identity);
      Ok(())
    })
    .await?
}
