//! Transport collaborator: issues remote operations and returns parsed bodies.
//!
//! The store never looks at status codes. A transport maps whatever protocol
//! it speaks onto success (a JSON body) or a [`TransportError`].

mod rest;

pub use rest::RestTransport;

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::identity::ResourceIdentifier;
use crate::query::FetchRequest;

/// Broad class of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportErrorKind {
  /// Could not reach the service
  Network,
  Timeout,
  /// The service answered with a failure
  Rejected,
  /// The body could not be understood
  Parse,
}

impl fmt::Display for TransportErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      TransportErrorKind::Network => "network error",
      TransportErrorKind::Timeout => "timed out",
      TransportErrorKind::Rejected => "rejected",
      TransportErrorKind::Parse => "unparseable response",
    };
    f.write_str(s)
  }
}

/// Opaque failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transport {kind}: {message}")]
pub struct TransportError {
  pub kind: TransportErrorKind,
  pub message: String,
}

impl TransportError {
  pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
    Self {
      kind,
      message: message.into(),
    }
  }

  pub fn network(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Network, message)
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Timeout, message)
  }

  pub fn rejected(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Rejected, message)
  }

  pub fn parse(message: impl Into<String>) -> Self {
    Self::new(TransportErrorKind::Parse, message)
  }
}

/// Describes one remote call: method, target and payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RemoteOperation {
  Fetch {
    request: FetchRequest,
  },
  FetchRelationship {
    entity: String,
    resource_identifier: ResourceIdentifier,
    relationship: String,
  },
  Insert {
    entity: String,
    payload: Value,
  },
  Update {
    entity: String,
    resource_identifier: ResourceIdentifier,
    payload: Value,
  },
  Delete {
    entity: String,
    resource_identifier: ResourceIdentifier,
  },
}

impl RemoteOperation {
  pub fn entity(&self) -> &str {
    match self {
      RemoteOperation::Fetch { request } => &request.entity,
      RemoteOperation::FetchRelationship { entity, .. }
      | RemoteOperation::Insert { entity, .. }
      | RemoteOperation::Update { entity, .. }
      | RemoteOperation::Delete { entity, .. } => entity,
    }
  }

  /// Short verb used in logs and events.
  pub fn method(&self) -> &'static str {
    match self {
      RemoteOperation::Fetch { .. } | RemoteOperation::FetchRelationship { .. } => "fetch",
      RemoteOperation::Insert { .. } => "insert",
      RemoteOperation::Update { .. } => "update",
      RemoteOperation::Delete { .. } => "delete",
    }
  }
}

impl fmt::Display for RemoteOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RemoteOperation::Fetch { request } => write!(f, "fetch {}", request),
      RemoteOperation::FetchRelationship {
        entity,
        resource_identifier,
        relationship,
      } => write!(f, "fetch {}/{}.{}", entity, resource_identifier, relationship),
      RemoteOperation::Insert { entity, .. } => write!(f, "insert {}", entity),
      RemoteOperation::Update {
        entity,
        resource_identifier,
        ..
      } => write!(f, "update {}/{}", entity, resource_identifier),
      RemoteOperation::Delete {
        entity,
        resource_identifier,
      } => write!(f, "delete {}/{}", entity, resource_identifier),
    }
  }
}

/// A remote data service.
#[async_trait]
pub trait Transport: Send + Sync {
  /// Perform the operation. A successful call with no body returns `Value::Null`.
  async fn request(&self, operation: &RemoteOperation) -> Result<Value, TransportError>;
}
