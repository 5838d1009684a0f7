//! Fetch requests and the predicate language forwarded to storage.
//!
//! Predicates are evaluated by the storage backend, never by the
//! orchestrators. The in-memory backend uses [`Predicate::matches`]; the SQLite
//! backend compiles the same tree to SQL with identical semantics (SQLite's
//! comparison rules: numbers sort before text, `NULL` never compares).

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::CacheRow;
use crate::identity::ResourceIdentifier;

/// Filter over cached rows of one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
  /// Every row
  #[default]
  All,
  Eq(String, Value),
  Ne(String, Value),
  Gt(String, Value),
  Lt(String, Value),
  In(String, Vec<Value>),
  IsNull(String),
  /// Relationship (to-one or to-many) contains the identifier
  RelatedTo(String, ResourceIdentifier),
  /// Row's own resource identifier is one of these
  IdentifierIn(Vec<ResourceIdentifier>),
  And(Vec<Predicate>),
  Or(Vec<Predicate>),
  Not(Box<Predicate>),
}

impl Predicate {
  pub fn eq(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
    Predicate::Eq(attribute.into(), value.into())
  }

  pub fn and(self, other: Predicate) -> Self {
    match self {
      Predicate::All => other,
      Predicate::And(mut parts) => {
        parts.push(other);
        Predicate::And(parts)
      }
      p => Predicate::And(vec![p, other]),
    }
  }

  /// Evaluate against a cached row.
  pub fn matches(&self, row: &CacheRow) -> bool {
    match self {
      Predicate::All => true,
      Predicate::Eq(attr, v) => Scalar::of(row.attribute(attr)) == Scalar::from(v),
      Predicate::Ne(attr, v) => Scalar::of(row.attribute(attr)) != Scalar::from(v),
      Predicate::Gt(attr, v) => {
        Scalar::of(row.attribute(attr)).compare(&Scalar::from(v)) == Some(Ordering::Greater)
      }
      Predicate::Lt(attr, v) => {
        Scalar::of(row.attribute(attr)).compare(&Scalar::from(v)) == Some(Ordering::Less)
      }
      Predicate::In(attr, values) => {
        let lhs = Scalar::of(row.attribute(attr));
        values.iter().any(|v| lhs == Scalar::from(v))
      }
      Predicate::IsNull(attr) => Scalar::of(row.attribute(attr)) == Scalar::Null,
      Predicate::RelatedTo(rel, rid) => row
        .relationships
        .get(rel)
        .map(|r| r.contains(rid))
        .unwrap_or(false),
      Predicate::IdentifierIn(ids) => ids.contains(&row.resource_identifier),
      Predicate::And(parts) => parts.iter().all(|p| p.matches(row)),
      Predicate::Or(parts) => parts.iter().any(|p| p.matches(row)),
      Predicate::Not(inner) => !inner.matches(row),
    }
  }

  /// The one identifier this predicate pins the result to, if it names
  /// exactly one at the top level.
  pub fn single_identifier(&self) -> Option<&ResourceIdentifier> {
    match self {
      Predicate::IdentifierIn(ids) if ids.len() == 1 => ids.first(),
      Predicate::And(parts) => {
        let mut pinned = parts.iter().filter_map(|p| p.single_identifier());
        match (pinned.next(), pinned.next()) {
          (Some(id), None) => Some(id),
          _ => None,
        }
      }
      _ => None,
    }
  }

  /// Top-level `attribute = value` pairs, usable as remote query parameters.
  pub fn equalities(&self) -> Vec<(&str, &Value)> {
    match self {
      Predicate::Eq(attr, v) => vec![(attr.as_str(), v)],
      Predicate::And(parts) => parts.iter().flat_map(|p| p.equalities()).collect(),
      _ => Vec::new(),
    }
  }
}

/// Ordering on one attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
  pub attribute: String,
  #[serde(default = "ascending")]
  pub ascending: bool,
}

fn ascending() -> bool {
  true
}

impl SortDescriptor {
  pub fn asc(attribute: impl Into<String>) -> Self {
    Self {
      attribute: attribute.into(),
      ascending: true,
    }
  }

  pub fn desc(attribute: impl Into<String>) -> Self {
    Self {
      attribute: attribute.into(),
      ascending: false,
    }
  }
}

/// Sort rows by the descriptors, then by resource identifier.
pub fn sort_rows(rows: &mut [CacheRow], sort: &[SortDescriptor]) {
  rows.sort_by(|a, b| {
    for descriptor in sort {
      let lhs = Scalar::of(a.attribute(&descriptor.attribute));
      let rhs = Scalar::of(b.attribute(&descriptor.attribute));
      let ord = lhs.sort_cmp(&rhs);
      let ord = if descriptor.ascending { ord } else { ord.reverse() };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    a.resource_identifier.cmp(&b.resource_identifier)
  });
}

/// A query against one entity: predicate, ordering and optional limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
  pub entity: String,
  #[serde(default)]
  pub predicate: Predicate,
  #[serde(default)]
  pub sort: Vec<SortDescriptor>,
  #[serde(default)]
  pub limit: Option<usize>,
}

impl FetchRequest {
  pub fn new(entity: impl Into<String>) -> Self {
    Self {
      entity: entity.into(),
      predicate: Predicate::All,
      sort: Vec::new(),
      limit: None,
    }
  }

  pub fn filter(mut self, predicate: Predicate) -> Self {
    self.predicate = self.predicate.and(predicate);
    self
  }

  pub fn sort_by(mut self, descriptor: SortDescriptor) -> Self {
    self.sort.push(descriptor);
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Stable key for the fetch log.
  pub fn cache_key(&self) -> String {
    let canonical = serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for FetchRequest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.entity)?;
    if self.predicate != Predicate::All {
      write!(f, " where {:?}", self.predicate)?;
    }
    if let Some(limit) = self.limit {
      write!(f, " limit {}", limit)?;
    }
    Ok(())
  }
}

/// A JSON value as SQLite sees it after `json_extract`.
#[derive(Debug, Clone)]
pub(crate) enum Scalar {
  Null,
  Integer(i64),
  Real(f64),
  Text(String),
}

impl Scalar {
  pub(crate) fn of(value: Option<&Value>) -> Self {
    value.map(Scalar::from).unwrap_or(Scalar::Null)
  }

  /// SQL comparison: `None` when either side is NULL.
  fn compare(&self, other: &Scalar) -> Option<Ordering> {
    match (self, other) {
      (Scalar::Null, _) | (_, Scalar::Null) => None,
      _ => Some(self.sort_cmp(other)),
    }
  }

  /// ORDER BY semantics: NULL < numbers < text.
  fn sort_cmp(&self, other: &Scalar) -> Ordering {
    fn rank(s: &Scalar) -> u8 {
      match s {
        Scalar::Null => 0,
        Scalar::Integer(_) | Scalar::Real(_) => 1,
        Scalar::Text(_) => 2,
      }
    }
    match (self, other) {
      (Scalar::Integer(a), Scalar::Integer(b)) => a.cmp(b),
      (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
      (a, b) if rank(a) == 1 && rank(b) == 1 => a
        .as_f64()
        .partial_cmp(&b.as_f64())
        .unwrap_or(Ordering::Equal),
      (a, b) => rank(a).cmp(&rank(b)),
    }
  }

  fn as_f64(&self) -> f64 {
    match self {
      Scalar::Integer(i) => *i as f64,
      Scalar::Real(r) => *r,
      _ => 0.0,
    }
  }
}

impl PartialEq for Scalar {
  /// SQL `IS`: NULL equals NULL, 1 equals 1.0
  fn eq(&self, other: &Scalar) -> bool {
    self.sort_cmp(other) == Ordering::Equal
  }
}

impl From<&Value> for Scalar {
  fn from(value: &Value) -> Self {
    match value {
      Value::Null => Scalar::Null,
      Value::Bool(b) => Scalar::Integer(i64::from(*b)),
      Value::Number(n) => match n.as_i64() {
        Some(i) => Scalar::Integer(i),
        None => Scalar::Real(n.as_f64().unwrap_or(0.0)),
      },
      Value::String(s) => Scalar::Text(s.clone()),
      // json_extract hands back nested values as JSON text
      other => Scalar::Text(other.to_string()),
    }
  }
}
