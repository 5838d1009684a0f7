//! Core types for the backing cache.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::identity::ResourceIdentifier;
use crate::transport::TransportError;

/// Value of one relationship on a cached row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationshipValue {
  ToOne(Option<ResourceIdentifier>),
  ToMany(Vec<ResourceIdentifier>),
}

impl RelationshipValue {
  pub fn contains(&self, rid: &ResourceIdentifier) -> bool {
    match self {
      RelationshipValue::ToOne(target) => target.as_ref() == Some(rid),
      RelationshipValue::ToMany(targets) => targets.contains(rid),
    }
  }

  pub fn identifiers(&self) -> Vec<ResourceIdentifier> {
    match self {
      RelationshipValue::ToOne(target) => target.iter().cloned().collect(),
      RelationshipValue::ToMany(targets) => targets.clone(),
    }
  }

  /// Point every reference to `old` at `new`. Returns whether anything changed.
  pub fn replace(&mut self, old: &ResourceIdentifier, new: &ResourceIdentifier) -> bool {
    let mut changed = false;
    let targets: Vec<&mut ResourceIdentifier> = match self {
      RelationshipValue::ToOne(target) => target.iter_mut().collect(),
      RelationshipValue::ToMany(targets) => targets.iter_mut().collect(),
    };
    for target in targets.into_iter().filter(|t| **t == *old) {
      *target = new.clone();
      changed = true;
    }
    changed
  }
}

/// The local materialization of one entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRow {
  pub entity: String,
  pub resource_identifier: ResourceIdentifier,
  #[serde(default)]
  pub attributes: Map<String, Value>,
  #[serde(default)]
  pub relationships: BTreeMap<String, RelationshipValue>,
  /// When the row was last written
  pub cached_at: DateTime<Utc>,
}

impl CacheRow {
  pub fn new(entity: impl Into<String>, resource_identifier: ResourceIdentifier) -> Self {
    Self {
      entity: entity.into(),
      resource_identifier,
      attributes: Map::new(),
      relationships: BTreeMap::new(),
      cached_at: Utc::now(),
    }
  }

  pub fn attribute(&self, name: &str) -> Option<&Value> {
    self.attributes.get(name)
  }

  pub fn relationship(&self, name: &str) -> Option<&RelationshipValue> {
    self.relationships.get(name)
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// Remote failure that forced a fallback to cached data
  pub notice: Option<TransportError>,
}

impl<T> CacheResult<T> {
  /// Data re-read from the cache after a remote import.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      notice: None,
    }
  }

  /// Data served from the cache without network I/O.
  pub fn from_cache(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      notice: None,
    }
  }

  /// Stale cached data returned because the remote call failed.
  pub fn offline(data: T, error: TransportError) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      notice: Some(error),
    }
  }

  pub fn is_offline(&self) -> bool {
    self.source == CacheSource::Offline
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Refreshed from the remote service
  Network,
  /// Local cache was sufficient, no network I/O
  Cache,
  /// Remote failed, serving previously cached data
  Offline,
}
