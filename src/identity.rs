//! Identity map between remote resource identifiers and local object identities.
//!
//! Every cached object is addressed by an [`ObjectIdentity`], a process-local
//! handle. The map keeps a bijection between registered identities and
//! `(entity, resource identifier)` pairs, so resolving the same pair twice
//! always hands back the same handle.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

const PLACEHOLDER_PREFIX: &str = "placeholder-";

/// Process-local handle for one cached entity instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectIdentity(pub(crate) u64);

impl ObjectIdentity {
  pub fn as_u64(self) -> u64 {
    self.0
  }
}

impl fmt::Display for ObjectIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "obj#{}", self.0)
  }
}

/// Durable identifier assigned by the remote service, or a local placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceIdentifier(String);

impl ResourceIdentifier {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  /// Fresh, locally unique identifier for a not-yet-synced insert.
  pub fn placeholder() -> Self {
    Self(format!("{}{}", PLACEHOLDER_PREFIX, uuid::Uuid::new_v4()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResourceIdentifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for ResourceIdentifier {
  fn from(s: &str) -> Self {
    Self(s.to_string())
  }
}

impl From<String> for ResourceIdentifier {
  fn from(s: String) -> Self {
    Self(s)
  }
}

/// An `(entity, resource identifier)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
  pub entity: String,
  pub resource_identifier: ResourceIdentifier,
}

impl ResourceKey {
  pub fn new(entity: impl Into<String>, resource_identifier: ResourceIdentifier) -> Self {
    Self {
      entity: entity.into(),
      resource_identifier,
    }
  }
}

impl fmt::Display for ResourceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.entity, self.resource_identifier)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IdentityState {
  /// Allocated for a local insert, no durable identifier yet
  Placeholder,
  /// Registered from a durable identifier
  Durable,
  /// Was a placeholder, rewritten to a durable identifier
  Promoted,
}

#[derive(Debug, Clone)]
struct IdentityEntry {
  key: ResourceKey,
  state: IdentityState,
}

/// Bidirectional map between identities and resource keys.
#[derive(Debug, Default)]
pub struct IdentityMap {
  next: u64,
  by_key: HashMap<ResourceKey, ObjectIdentity>,
  entries: HashMap<ObjectIdentity, IdentityEntry>,
}

impl IdentityMap {
  pub fn new() -> Self {
    Self::default()
  }

  /// Return the identity for the pair, registering a new one if needed.
  pub fn resolve(
    &mut self,
    entity: &str,
    resource_identifier: &ResourceIdentifier,
  ) -> ObjectIdentity {
    let key = ResourceKey::new(entity, resource_identifier.clone());
    if let Some(identity) = self.by_key.get(&key) {
      return *identity;
    }
    self.register(key, IdentityState::Durable)
  }

  /// Identity for the pair, if one has been registered.
  pub fn get(
    &self,
    entity: &str,
    resource_identifier: &ResourceIdentifier,
  ) -> Option<ObjectIdentity> {
    self
      .by_key
      .get(&ResourceKey::new(entity, resource_identifier.clone()))
      .copied()
  }

  pub fn lookup(&self, identity: ObjectIdentity) -> StoreResult<ResourceKey> {
    self
      .entries
      .get(&identity)
      .map(|e| e.key.clone())
      .ok_or(StoreError::UnknownIdentity(identity))
  }

  /// Allocate an identity for a locally created object.
  pub fn register_placeholder(&mut self, entity: &str) -> ObjectIdentity {
    let key = ResourceKey::new(entity, ResourceIdentifier::placeholder());
    self.register(key, IdentityState::Placeholder)
  }

  pub fn is_placeholder(&self, identity: ObjectIdentity) -> StoreResult<bool> {
    self
      .entries
      .get(&identity)
      .map(|e| e.state == IdentityState::Placeholder)
      .ok_or(StoreError::UnknownIdentity(identity))
  }

  /// Rewrite a placeholder to its durable identifier.
  ///
  /// Returns the replaced placeholder identifier, or `None` when the identity
  /// already carries `resource_identifier`.
  pub fn promote(
    &mut self,
    identity: ObjectIdentity,
    resource_identifier: &ResourceIdentifier,
  ) -> StoreResult<Option<ResourceIdentifier>> {
    let entry = self
      .entries
      .get(&identity)
      .ok_or(StoreError::UnknownIdentity(identity))?;

    if entry.state != IdentityState::Placeholder {
      if &entry.key.resource_identifier == resource_identifier {
        return Ok(None);
      }
      return Err(StoreError::AlreadyPromoted {
        identity,
        current: entry.key.resource_identifier.clone(),
        requested: resource_identifier.clone(),
      });
    }

    let new_key = ResourceKey::new(entry.key.entity.clone(), resource_identifier.clone());
    if let Some(existing) = self.by_key.get(&new_key) {
      return Err(StoreError::IdentityConflict {
        entity: new_key.entity,
        resource_identifier: resource_identifier.clone(),
        existing: *existing,
      });
    }

    let old_key = entry.key.clone();
    self.by_key.remove(&old_key);
    self.by_key.insert(new_key.clone(), identity);
    self.entries.insert(
      identity,
      IdentityEntry {
        key: new_key,
        state: IdentityState::Promoted,
      },
    );

    Ok(Some(old_key.resource_identifier))
  }

  /// Undo a promotion whose cache write did not commit.
  pub(crate) fn revert_promotion(
    &mut self,
    identity: ObjectIdentity,
    placeholder: ResourceIdentifier,
  ) {
    let Some(entry) = self.entries.get_mut(&identity) else {
      return;
    };
    if entry.state != IdentityState::Promoted {
      return;
    }
    let old_key = ResourceKey::new(entry.key.entity.clone(), placeholder);
    self.by_key.remove(&entry.key);
    self.by_key.insert(old_key.clone(), identity);
    entry.key = old_key;
    entry.state = IdentityState::Placeholder;
  }

  /// Drop the identity and its pair. Later lookups fail with `UnknownIdentity`.
  pub fn purge(&mut self, identity: ObjectIdentity) -> Option<ResourceKey> {
    let entry = self.entries.remove(&identity)?;
    self.by_key.remove(&entry.key);
    Some(entry.key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  fn register(&mut self, key: ResourceKey, state: IdentityState) -> ObjectIdentity {
    self.next += 1;
    let identity = ObjectIdentity(self.next);
    self.by_key.insert(key.clone(), identity);
    self.entries.insert(identity, IdentityEntry { key, state });
    identity
  }
}
