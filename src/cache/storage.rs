//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::{ToSqlOutput, Value as SqlValue};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use super::traits::CacheRow;
use crate::identity::ResourceKey;
use crate::query::{FetchRequest, Predicate, Scalar};

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("database error: {0}")]
  Database(#[from] rusqlite::Error),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("lock poisoned: {0}")]
  LockPoisoned(String),

  #[error("invalid data: {0}")]
  InvalidData(String),
}

/// One write inside an atomic batch.
#[derive(Debug, Clone)]
pub enum RowWrite {
  /// Insert or replace the row under its `(entity, resource identifier)` key
  Upsert(CacheRow),
  Delete(ResourceKey),
  /// Record a successful remote fetch for a query key
  MarkFetched {
    key: String,
    description: String,
    entity: String,
    at: DateTime<Utc>,
  },
}

/// Trait for storage backends holding cached rows.
///
/// `write_batch` must apply the whole batch or nothing, and concurrent readers
/// must never observe part of a batch.
pub trait RowStorage: Send + Sync {
  fn read_row(&self, key: &ResourceKey) -> StorageResult<Option<CacheRow>>;

  fn write_batch(&self, writes: &[RowWrite]) -> StorageResult<()>;

  /// Rows of `request.entity` matching its predicate, sorted and limited.
  fn query(&self, request: &FetchRequest) -> StorageResult<Vec<CacheRow>>;

  /// When the query key was last fetched from the remote service.
  fn last_fetched(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Create a new SQLite storage at the default location.
  pub fn open() -> StorageResult<Self> {
    let path = Self::default_path()?;
    Self::open_at(&path)
  }

  /// Open or create the database at `path`.
  pub fn open_at(path: &Path) -> StorageResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    Self::with_connection(conn)
  }

  pub fn open_in_memory() -> StorageResult<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  /// Get the default database path.
  pub fn default_path() -> StorageResult<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StorageError::InvalidData("could not determine data directory".into()))?;

    Ok(data_dir.join("incstore").join("cache.db"))
  }

  fn with_connection(conn: Connection) -> StorageResult<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> StorageResult<()> {
    let conn = self.lock()?;
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(())
  }

  fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| StorageError::LockPoisoned(e.to_string()))
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per (entity, resource identifier), serialized as JSON
CREATE TABLE IF NOT EXISTS cache_rows (
    entity_type TEXT NOT NULL,
    resource_identifier TEXT NOT NULL,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (entity_type, resource_identifier)
);

-- Last successful remote fetch per query
CREATE TABLE IF NOT EXISTS fetch_log (
    query_hash TEXT PRIMARY KEY,
    query_description TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_fetch_log_entity ON fetch_log(entity_type);
"#;

impl RowStorage for SqliteStorage {
  fn read_row(&self, key: &ResourceKey) -> StorageResult<Option<CacheRow>> {
    let conn = self.lock()?;

    let data: Option<String> = conn
      .query_row(
        "SELECT data FROM cache_rows WHERE entity_type = ? AND resource_identifier = ?",
        params![key.entity, key.resource_identifier.as_str()],
        |row| row.get(0),
      )
      .optional()?;

    match data {
      Some(data) => Ok(Some(serde_json::from_str(&data)?)),
      None => Ok(None),
    }
  }

  fn write_batch(&self, writes: &[RowWrite]) -> StorageResult<()> {
    let mut conn = self.lock()?;

    // Dropping the transaction without commit rolls everything back
    let tx = conn.transaction()?;

    for write in writes {
      match write {
        RowWrite::Upsert(row) => {
          let data = serde_json::to_string(row)?;
          tx.execute(
            "INSERT OR REPLACE INTO cache_rows (entity_type, resource_identifier, data, cached_at)
             VALUES (?, ?, ?, ?)",
            params![
              row.entity,
              row.resource_identifier.as_str(),
              data,
              row.cached_at.to_rfc3339()
            ],
          )?;
        }
        RowWrite::Delete(key) => {
          tx.execute(
            "DELETE FROM cache_rows WHERE entity_type = ? AND resource_identifier = ?",
            params![key.entity, key.resource_identifier.as_str()],
          )?;
        }
        RowWrite::MarkFetched {
          key,
          description,
          entity,
          at,
        } => {
          tx.execute(
            "INSERT OR REPLACE INTO fetch_log (query_hash, query_description, entity_type, fetched_at)
             VALUES (?, ?, ?, ?)",
            params![key, description, entity, at.to_rfc3339()],
          )?;
        }
      }
    }

    tx.commit()?;
    Ok(())
  }

  fn query(&self, request: &FetchRequest) -> StorageResult<Vec<CacheRow>> {
    let mut sql = SqlBuilder::default();
    sql.push("SELECT data FROM cache_rows WHERE entity_type = ? AND ");
    sql.bind(Scalar::Text(request.entity.clone()));
    sql.predicate(&request.predicate);

    sql.push(" ORDER BY ");
    for descriptor in &request.sort {
      sql.push("json_extract(data, ?) ");
      sql.bind(Scalar::Text(attribute_path(&descriptor.attribute)));
      sql.push(if descriptor.ascending { "ASC, " } else { "DESC, " });
    }
    sql.push("resource_identifier ASC");

    if let Some(limit) = request.limit {
      sql.push(" LIMIT ?");
      sql.bind(Scalar::Integer(limit as i64));
    }

    let conn = self.lock()?;
    let mut stmt = conn.prepare(&sql.sql)?;
    let data: Vec<String> = stmt
      .query_map(params_from_iter(sql.params.iter()), |row| row.get(0))?
      .collect::<Result<_, _>>()?;

    data
      .iter()
      .map(|d| serde_json::from_str(d).map_err(StorageError::from))
      .collect()
  }

  fn last_fetched(&self, key: &str) -> StorageResult<Option<DateTime<Utc>>> {
    let conn = self.lock()?;

    let fetched_at: Option<String> = conn
      .query_row(
        "SELECT fetched_at FROM fetch_log WHERE query_hash = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()?;

    fetched_at.as_deref().map(parse_datetime).transpose()
  }
}

impl ToSql for Scalar {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    Ok(ToSqlOutput::Owned(match self {
      Scalar::Null => SqlValue::Null,
      Scalar::Integer(i) => SqlValue::Integer(*i),
      Scalar::Real(r) => SqlValue::Real(*r),
      Scalar::Text(s) => SqlValue::Text(s.clone()),
    }))
  }
}

/// Accumulates SQL text and its positional parameters.
#[derive(Default)]
struct SqlBuilder {
  sql: String,
  params: Vec<Scalar>,
}

impl SqlBuilder {
  fn push(&mut self, s: &str) {
    self.sql.push_str(s);
  }

  fn bind(&mut self, value: Scalar) {
    self.params.push(value);
  }

  /// Compile a predicate. Every branch yields 0 or 1, never NULL, so `NOT`
  /// agrees with the in-memory evaluator.
  fn predicate(&mut self, predicate: &Predicate) {
    match predicate {
      Predicate::All => self.push("1"),
      Predicate::Eq(attr, v) => self.comparison(attr, "IS", v),
      Predicate::Ne(attr, v) => self.comparison(attr, "IS NOT", v),
      Predicate::Gt(attr, v) => {
        self.push("COALESCE(");
        self.comparison(attr, ">", v);
        self.push(", 0)");
      }
      Predicate::Lt(attr, v) => {
        self.push("COALESCE(");
        self.comparison(attr, "<", v);
        self.push(", 0)");
      }
      Predicate::In(attr, values) => {
        let parts: Vec<Predicate> = values
          .iter()
          .map(|v| Predicate::Eq(attr.clone(), v.clone()))
          .collect();
        self.join(&parts, " OR ", "0");
      }
      Predicate::IsNull(attr) => {
        self.push("(json_extract(data, ?) IS NULL)");
        self.bind(Scalar::Text(attribute_path(attr)));
      }
      Predicate::RelatedTo(rel, rid) => {
        self.push("EXISTS (SELECT 1 FROM json_each(data, ?) WHERE json_each.value = ?)");
        self.bind(Scalar::Text(relationship_path(rel)));
        self.bind(Scalar::Text(rid.as_str().to_string()));
      }
      Predicate::IdentifierIn(ids) => {
        if ids.is_empty() {
          self.push("0");
          return;
        }
        let marks = vec!["?"; ids.len()].join(", ");
        self.push(&format!("resource_identifier IN ({})", marks));
        for id in ids {
          self.bind(Scalar::Text(id.as_str().to_string()));
        }
      }
      Predicate::And(parts) => self.join(parts, " AND ", "1"),
      Predicate::Or(parts) => self.join(parts, " OR ", "0"),
      Predicate::Not(inner) => {
        self.push("NOT ");
        self.predicate(inner);
      }
    }
  }

  fn comparison(&mut self, attr: &str, op: &str, value: &serde_json::Value) {
    self.push(&format!("(json_extract(data, ?) {} ?)", op));
    self.bind(Scalar::Text(attribute_path(attr)));
    self.bind(Scalar::from(value));
  }

  fn join(&mut self, parts: &[Predicate], sep: &str, empty: &str) {
    if parts.is_empty() {
      self.push(empty);
      return;
    }
    self.push("(");
    for (i, part) in parts.iter().enumerate() {
      if i > 0 {
        self.push(sep);
      }
      self.predicate(part);
    }
    self.push(")");
  }
}

fn attribute_path(name: &str) -> String {
  format!("$.attributes.\"{}\"", name.replace('"', ""))
}

fn relationship_path(name: &str) -> String {
  format!("$.relationships.\"{}\"", name.replace('"', ""))
}

/// Parse an RFC 3339 timestamp stored by this module.
fn parse_datetime(s: &str) -> StorageResult<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| StorageError::InvalidData(format!("failed to parse datetime '{}': {}", s, e)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::RelationshipValue;
  use crate::identity::ResourceIdentifier;
  use crate::query::SortDescriptor;
  use serde_json::json;

  fn user(id: &str, attrs: serde_json::Value) -> CacheRow {
    let mut row = CacheRow::new("user", ResourceIdentifier::from(id));
    if let serde_json::Value::Object(map) = attrs {
      row.attributes.extend(map);
    }
    row
  }

  fn seeded() -> SqliteStorage {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let mut bob = user("2", json!({"name": "Bob", "age": 25}));
    bob.relationships.insert(
      "teams".into(),
      RelationshipValue::ToMany(vec!["t1".into(), "t2".into()]),
    );
    storage
      .write_batch(&[
        RowWrite::Upsert(user("1", json!({"name": "Ann", "age": 31, "admin": true}))),
        RowWrite::Upsert(bob),
        RowWrite::Upsert(user("3", json!({"name": "Cid"}))),
      ])
      .unwrap();
    storage
  }

  fn ids(rows: &[CacheRow]) -> Vec<&str> {
    rows.iter().map(|r| r.resource_identifier.as_str()).collect()
  }

  #[test]
  fn test_read_write_delete() {
    let storage = seeded();
    let key = ResourceKey::new("user", "1".into());

    let row = storage.read_row(&key).unwrap().unwrap();
    assert_eq!(row.attribute("name"), Some(&json!("Ann")));

    storage.write_batch(&[RowWrite::Delete(key.clone())]).unwrap();
    assert!(storage.read_row(&key).unwrap().is_none());
  }

  #[test]
  fn test_query_predicates_match_memory_semantics() {
    let storage = seeded();
    let all = storage.query(&FetchRequest::new("user")).unwrap();

    let cases = vec![
      Predicate::eq("name", "Bob"),
      Predicate::eq("admin", true),
      Predicate::Gt("age".into(), json!(30)),
      Predicate::Not(Box::new(Predicate::Gt("age".into(), json!(30)))),
      Predicate::IsNull("age".into()),
      Predicate::Ne("name".into(), json!("Ann")),
      Predicate::In("name".into(), vec![json!("Ann"), json!("Cid")]),
      Predicate::RelatedTo("teams".into(), "t2".into()),
      Predicate::IdentifierIn(vec!["1".into(), "3".into()]),
      Predicate::Or(vec![]),
    ];

    for predicate in cases {
      let request = FetchRequest::new("user").filter(predicate.clone());
      let expected: Vec<&str> = all
        .iter()
        .filter(|r| predicate.matches(r))
        .map(|r| r.resource_identifier.as_str())
        .collect();
      let rows = storage.query(&request).unwrap();
      assert_eq!(ids(&rows), expected, "predicate {:?}", predicate);
    }
  }

  #[test]
  fn test_query_sort_and_limit() {
    let storage = seeded();
    let request = FetchRequest::new("user")
      .sort_by(SortDescriptor::desc("age"))
      .limit(2);
    let rows = storage.query(&request).unwrap();
    assert_eq!(ids(&rows), vec!["1", "2"]);
  }

  #[test]
  fn test_fetch_log() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.last_fetched("q").unwrap().is_none());

    let at = Utc::now();
    storage
      .write_batch(&[RowWrite::MarkFetched {
        key: "q".into(),
        description: "user".into(),
        entity: "user".into(),
        at,
      }])
      .unwrap();
    let fetched = storage.last_fetched("q").unwrap().unwrap();
    assert_eq!(fetched.timestamp(), at.timestamp());
  }

  #[test]
  fn test_reopen_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    {
      let storage = SqliteStorage::open_at(&path).unwrap();
      storage
        .write_batch(&[RowWrite::Upsert(user("9", json!({"name": "Dee"})))])
        .unwrap();
    }
    let storage = SqliteStorage::open_at(&path).unwrap();
    let rows = storage.query(&FetchRequest::new("user")).unwrap();
    assert_eq!(ids(&rows), vec!["9"]);
  }
}
