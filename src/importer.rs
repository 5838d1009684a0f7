//! Representation importer: turns nested remote representations into rows.
//!
//! Imports never create duplicate identities. Attribute fields missing from a
//! representation are left untouched on the row, so a narrow fetch does not
//! erase what a wide fetch stored. The identity and the row are staged before
//! recursing into relationships, which makes a re-entrant import of the same
//! object merge into the staged row instead of starting over.

use chrono::Utc;
use serde_json::Value;
use tracing::trace;

use crate::cache::{CacheRow, CacheTransaction, RelationshipValue};
use crate::error::{StoreError, StoreResult};
use crate::identity::{IdentityMap, ObjectIdentity, ResourceIdentifier, ResourceKey};
use crate::representation::{identifier_of, reference_identifier, Representation};
use crate::schema::{Cardinality, RelationshipDescription, Schema};

/// Imports representations into a cache transaction.
pub struct Importer<'a, 'c> {
  schema: &'a Schema,
  identities: &'a mut IdentityMap,
  tx: &'a mut CacheTransaction<'c>,
}

impl<'a, 'c> Importer<'a, 'c> {
  pub fn new(
    schema: &'a Schema,
    identities: &'a mut IdentityMap,
    tx: &'a mut CacheTransaction<'c>,
  ) -> Self {
    Self {
      schema,
      identities,
      tx,
    }
  }

  /// Import every representation, in order. Stops at the first error; the
  /// caller drops the transaction so nothing from the batch is written.
  pub fn import_all(
    &mut self,
    representations: &[Representation],
    entity: &str,
  ) -> StoreResult<Vec<ObjectIdentity>> {
    representations
      .iter()
      .map(|rep| self.import(rep, entity).map(|(identity, _)| identity))
      .collect()
  }

  /// Import one representation and, recursively, everything it embeds.
  pub fn import(
    &mut self,
    representation: &Representation,
    entity: &str,
  ) -> StoreResult<(ObjectIdentity, CacheRow)> {
    let schema = self.schema;
    let description = schema.entity(entity)?;
    let resource_identifier = identifier_of(representation, description)?;

    // Register before recursing
    let identity = self.identities.resolve(entity, &resource_identifier);
    let key = ResourceKey::new(entity, resource_identifier);

    let mut row = self.current_row(&key)?;
    for (field, value) in representation {
      if description.is_attribute(field) {
        row.attributes.insert(field.clone(), value.clone());
      }
    }
    row.cached_at = Utc::now();
    self.tx.stage(row);

    for (name, relationship) in &description.relationships {
      let Some(value) = representation.get(name) else {
        continue;
      };
      let related = self.import_relationship(entity, name, relationship, value)?;

      let mut row = self.current_row(&key)?;
      row.relationships.insert(name.clone(), related);
      self.tx.stage(row);
    }

    trace!(entity, identity = %identity, "imported representation");
    Ok((identity, self.current_row(&key)?))
  }

  fn current_row(&self, key: &ResourceKey) -> StoreResult<CacheRow> {
    Ok(
      self
        .tx
        .row(key)?
        .unwrap_or_else(|| CacheRow::new(key.entity.clone(), key.resource_identifier.clone())),
    )
  }

  fn import_relationship(
    &mut self,
    entity: &str,
    name: &str,
    relationship: &RelationshipDescription,
    value: &Value,
  ) -> StoreResult<RelationshipValue> {
    let mismatch = || StoreError::CardinalityMismatch {
      entity: entity.to_string(),
      relationship: name.to_string(),
      expected: relationship.cardinality.describe(),
    };

    match (relationship.cardinality, value) {
      (Cardinality::ToOne, Value::Null) => Ok(RelationshipValue::ToOne(None)),
      (Cardinality::ToMany, Value::Null) => Ok(RelationshipValue::ToMany(Vec::new())),
      (Cardinality::ToOne, Value::Array(_)) => Err(mismatch()),
      (Cardinality::ToOne, value) => {
        let target = self.import_related(&relationship.target, value)?;
        Ok(RelationshipValue::ToOne(Some(target)))
      }
      (Cardinality::ToMany, Value::Array(items)) => {
        let mut targets: Vec<ResourceIdentifier> = Vec::with_capacity(items.len());
        for item in items {
          if item.is_array() {
            return Err(mismatch());
          }
          let target = self.import_related(&relationship.target, item)?;
          if !targets.contains(&target) {
            targets.push(target);
          }
        }
        Ok(RelationshipValue::ToMany(targets))
      }
      (Cardinality::ToMany, _) => Err(mismatch()),
    }
  }

  /// A nested object is imported; a bare scalar is a reference by identifier.
  fn import_related(&mut self, target: &str, value: &Value) -> StoreResult<ResourceIdentifier> {
    match value {
      Value::Object(rep) => {
        let (_, row) = self.import(rep, target)?;
        Ok(row.resource_identifier)
      }
      scalar => {
        let schema = self.schema;
        let rid = reference_identifier(scalar).ok_or_else(|| {
          let description = schema.entity(target);
          StoreError::MissingIdentifier {
            entity: target.to_string(),
            field: description
              .map(|d| d.identifier.clone())
              .unwrap_or_else(|_| "id".to_string()),
          }
        })?;
        self.identities.resolve(target, &rid);
        Ok(rid)
      }
    }
  }
}
