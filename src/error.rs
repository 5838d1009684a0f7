//! Error types for the store.

use std::fmt;

use thiserror::Error;

use crate::cache::StorageError;
use crate::identity::{ObjectIdentity, ResourceIdentifier};
use crate::save::MutationKind;
use crate::transport::TransportError;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur while resolving, importing, fetching or saving.
#[derive(Debug, Error)]
pub enum StoreError {
  /// A representation did not carry the entity's identifier field.
  #[error("representation of {entity} has no `{field}` identifier")]
  MissingIdentifier { entity: String, field: String },

  /// A to-one relationship was given a collection, or a to-many a single value.
  #[error("cardinality mismatch on {entity}.{relationship}: expected {expected}")]
  CardinalityMismatch {
    entity: String,
    relationship: String,
    expected: &'static str,
  },

  /// The identity was never registered or has been purged.
  #[error("unknown object identity {0}")]
  UnknownIdentity(ObjectIdentity),

  /// A promoted identity was asked to take a second durable identifier.
  #[error("{identity} already promoted to {current}, refusing {requested}")]
  AlreadyPromoted {
    identity: ObjectIdentity,
    current: ResourceIdentifier,
    requested: ResourceIdentifier,
  },

  /// The durable identifier already belongs to a different identity.
  #[error("{entity}/{resource_identifier} is already bound to {existing}")]
  IdentityConflict {
    entity: String,
    resource_identifier: ResourceIdentifier,
    existing: ObjectIdentity,
  },

  /// The identity still carries a placeholder identifier.
  #[error("{0} has not been synced to the remote service yet")]
  PlaceholderIdentity(ObjectIdentity),

  /// The scoped cache transaction could not be committed; nothing was written.
  #[error("cache write failed: {0}")]
  CacheWriteFailed(#[source] StorageError),

  /// A read against the storage backend failed.
  #[error("storage error: {0}")]
  Storage(#[from] StorageError),

  /// The remote service call failed.
  #[error(transparent)]
  Transport(#[from] TransportError),

  /// Entity not described by the schema.
  #[error("unknown entity: {0}")]
  UnknownEntity(String),

  /// Relationship not described by the schema.
  #[error("unknown relationship {entity}.{relationship}")]
  UnknownRelationship { entity: String, relationship: String },

  /// A row expected in the cache is not there.
  #[error("no cached row for {0}")]
  NotFound(ObjectIdentity),

  /// `save` was called on a context whose save batch is still active.
  #[error("a save is already active on context {0}")]
  ReentrantSave(u64),

  /// The operation was cancelled before its transport call resolved.
  #[error("operation cancelled")]
  Cancelled,

  /// One or more mutations of a save batch failed.
  #[error("{} of the save batch failed: {}", plural(.0.len()), list(.0))]
  SaveFailed(Vec<MutationFailure>),

  /// The ordered work queue has shut down.
  #[error("work queue closed")]
  QueueClosed,
}

/// One failed mutation inside an aggregate save failure.
#[derive(Debug)]
pub struct MutationFailure {
  pub identity: ObjectIdentity,
  pub kind: MutationKind,
  pub error: StoreError,
}

impl fmt::Display for MutationFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}: {}", self.kind, self.identity, self.error)
  }
}

impl StoreError {
  /// Whether this error indicates a schema or service contract violation
  /// rather than a transient condition.
  pub fn is_contract_violation(&self) -> bool {
    matches!(
      self,
      StoreError::AlreadyPromoted { .. }
        | StoreError::CardinalityMismatch { .. }
        | StoreError::IdentityConflict { .. }
    )
  }
}

fn plural(n: usize) -> String {
  if n == 1 {
    "1 mutation".to_string()
  } else {
    format!("{} mutations", n)
  }
}

fn list(failures: &[MutationFailure]) -> String {
  failures
    .iter()
    .map(|f| f.to_string())
    .collect::<Vec<_>>()
    .join("; ")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_contract_violations_are_told_apart_from_transient_failures() {
    let conflict = StoreError::IdentityConflict {
      entity: "user".into(),
      resource_identifier: "42".into(),
      existing: ObjectIdentity(1),
    };
    assert!(conflict.is_contract_violation());
    assert!(StoreError::CardinalityMismatch {
      entity: "post".into(),
      relationship: "author".into(),
      expected: "a single representation",
    }
    .is_contract_violation());

    assert!(!StoreError::Cancelled.is_contract_violation());
    assert!(!StoreError::Transport(TransportError::network("reset")).is_contract_violation());
  }
}
