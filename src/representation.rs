//! Remote representations and helpers for pulling them out of responses.

use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};
use crate::identity::ResourceIdentifier;
use crate::schema::EntityDescription;
use crate::transport::TransportError;

/// A parsed remote object: field name to scalar, nested object or sequence.
pub type Representation = Map<String, Value>;

/// Split a response body into the representations it carries.
///
/// A body may be a single object, an array of objects, or an envelope keyed
/// by the entity's `root_key`. `null` carries nothing.
pub fn representations_from_response(
  entity: &EntityDescription,
  body: Value,
) -> Result<Vec<Representation>, TransportError> {
  match body {
    Value::Null => Ok(Vec::new()),
    Value::Array(items) => items
      .into_iter()
      .map(|item| match item {
        Value::Object(rep) => Ok(rep),
        other => Err(TransportError::parse(format!(
          "expected {} object in response array, got {}",
          entity.name,
          kind_of(&other)
        ))),
      })
      .collect(),
    Value::Object(mut obj) => {
      if let Some(root_key) = &entity.root_key {
        if let Some(inner) = obj.remove(root_key) {
          return representations_from_response(entity, inner);
        }
      }
      Ok(vec![obj])
    }
    other => Err(TransportError::parse(format!(
      "expected {} representation, got {}",
      entity.name,
      kind_of(&other)
    ))),
  }
}

/// Extract the resource identifier from a representation.
pub fn identifier_of(
  rep: &Representation,
  entity: &EntityDescription,
) -> StoreResult<ResourceIdentifier> {
  rep
    .get(&entity.identifier)
    .and_then(reference_identifier)
    .ok_or_else(|| StoreError::MissingIdentifier {
      entity: entity.name.clone(),
      field: entity.identifier.clone(),
    })
}

/// Interpret a scalar value as a resource identifier.
pub fn reference_identifier(value: &Value) -> Option<ResourceIdentifier> {
  match value {
    Value::String(s) if !s.is_empty() => Some(ResourceIdentifier::new(s.clone())),
    Value::Number(n) => Some(ResourceIdentifier::new(n.to_string())),
    _ => None,
  }
}

pub(crate) fn kind_of(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "boolean",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}
