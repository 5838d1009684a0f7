//! Schema descriptor handed to the store at construction.
//!
//! Describes, per entity, its attributes, its relationships with their
//! cardinality and target, and which representation field carries the
//! resource identifier.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// Relationship cardinality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
  ToOne,
  ToMany,
}

impl Cardinality {
  pub fn describe(self) -> &'static str {
    match self {
      Cardinality::ToOne => "a single representation",
      Cardinality::ToMany => "a collection",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDescription {
  /// Target entity name
  pub target: String,
  pub cardinality: Cardinality,
}

/// Description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityDescription {
  /// Filled from the schema map key
  #[serde(skip)]
  pub name: String,
  /// Representation field holding the resource identifier
  #[serde(default = "default_identifier")]
  pub identifier: String,
  #[serde(default)]
  pub attributes: BTreeSet<String>,
  #[serde(default)]
  pub relationships: BTreeMap<String, RelationshipDescription>,
  /// Remote collection path (defaults to the entity name with an `s`)
  #[serde(default)]
  pub path: Option<String>,
  /// Envelope key wrapping representations in responses, if any
  #[serde(default)]
  pub root_key: Option<String>,
}

fn default_identifier() -> String {
  "id".to_string()
}

impl EntityDescription {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      identifier: default_identifier(),
      attributes: BTreeSet::new(),
      relationships: BTreeMap::new(),
      path: None,
      root_key: None,
    }
  }

  pub fn identified_by(mut self, field: impl Into<String>) -> Self {
    self.identifier = field.into();
    self
  }

  pub fn attribute(mut self, name: impl Into<String>) -> Self {
    self.attributes.insert(name.into());
    self
  }

  pub fn to_one(self, name: impl Into<String>, target: impl Into<String>) -> Self {
    self.relationship(name, target, Cardinality::ToOne)
  }

  pub fn to_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
    self.relationship(name, target, Cardinality::ToMany)
  }

  pub fn relationship(
    mut self,
    name: impl Into<String>,
    target: impl Into<String>,
    cardinality: Cardinality,
  ) -> Self {
    self.relationships.insert(
      name.into(),
      RelationshipDescription {
        target: target.into(),
        cardinality,
      },
    );
    self
  }

  pub fn at_path(mut self, path: impl Into<String>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn wrapped_in(mut self, root_key: impl Into<String>) -> Self {
    self.root_key = Some(root_key.into());
    self
  }

  /// Remote collection path for this entity, without leading slash.
  pub fn resource_path(&self) -> String {
    match &self.path {
      Some(p) => p.trim_matches('/').to_string(),
      None => format!("{}s", self.name),
    }
  }

  pub fn is_attribute(&self, field: &str) -> bool {
    self.attributes.contains(field)
  }
}

/// All entity descriptions known to a store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, EntityDescription>")]
#[serde(into = "BTreeMap<String, EntityDescription>")]
pub struct Schema {
  entities: BTreeMap<String, EntityDescription>,
}

impl From<BTreeMap<String, EntityDescription>> for Schema {
  fn from(entities: BTreeMap<String, EntityDescription>) -> Self {
    let entities = entities
      .into_iter()
      .map(|(name, mut entity)| {
        entity.name = name.clone();
        (name, entity)
      })
      .collect();
    Self { entities }
  }
}

impl From<Schema> for BTreeMap<String, EntityDescription> {
  fn from(schema: Schema) -> Self {
    schema.entities
  }
}

impl Schema {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_entity(mut self, entity: EntityDescription) -> Self {
    self.entities.insert(entity.name.clone(), entity);
    self
  }

  pub fn entity(&self, name: &str) -> StoreResult<&EntityDescription> {
    self
      .entities
      .get(name)
      .ok_or_else(|| StoreError::UnknownEntity(name.to_string()))
  }

  pub fn relationship(&self, entity: &str, name: &str) -> StoreResult<&RelationshipDescription> {
    self
      .entity(entity)?
      .relationships
      .get(name)
      .ok_or_else(|| StoreError::UnknownRelationship {
        entity: entity.to_string(),
        relationship: name.to_string(),
      })
  }

  pub fn entities(&self) -> impl Iterator<Item = &EntityDescription> {
    self.entities.values()
  }

  /// `(entity, relationship)` pairs whose relationship targets `target`.
  pub fn relationships_targeting<'a>(
    &'a self,
    target: &'a str,
  ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
    self.entities.values().flat_map(move |entity| {
      entity
        .relationships
        .iter()
        .filter(move |(_, rel)| rel.target == target)
        .map(move |(name, _)| (entity.name.as_str(), name.as_str()))
    })
  }

  /// Check that every relationship points at a described entity.
  pub fn validate(&self) -> StoreResult<()> {
    for entity in self.entities.values() {
      for rel in entity.relationships.values() {
        if !self.entities.contains_key(&rel.target) {
          return Err(StoreError::UnknownEntity(rel.target.clone()));
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_schema_from_yaml() {
    let yaml = r#"
user:
  attributes: [name, email]
  relationships:
    posts: { target: post, cardinality: to_many }
post:
  identifier: slug
  path: /v1/articles
  root_key: articles
  attributes: [title]
  relationships:
    author: { target: user, cardinality: to_one }
"#;
    let schema: Schema = serde_yaml::from_str(yaml).unwrap();
    schema.validate().unwrap();

    let user = schema.entity("user").unwrap();
    assert_eq!(user.name, "user");
    assert_eq!(user.identifier, "id");
    assert!(user.is_attribute("email"));
    assert_eq!(user.resource_path(), "users");

    let post = schema.entity("post").unwrap();
    assert_eq!(post.identifier, "slug");
    assert_eq!(post.resource_path(), "v1/articles");
    assert_eq!(
      schema.relationship("post", "author").unwrap().cardinality,
      Cardinality::ToOne
    );
  }

  #[test]
  fn test_validate_rejects_dangling_target() {
    let schema = Schema::new().with_entity(EntityDescription::new("user").to_one("team", "team"));
    assert!(matches!(schema.validate(), Err(StoreError::UnknownEntity(t)) if t == "team"));
  }

  #[test]
  fn test_relationships_targeting() {
    let schema = Schema::new()
      .with_entity(
        EntityDescription::new("user")
          .to_many("posts", "post")
          .to_one("best_friend", "user"),
      )
      .with_entity(EntityDescription::new("post").to_one("author", "user"));

    let mut pairs: Vec<_> = schema.relationships_targeting("user").collect();
    pairs.sort();
    assert_eq!(pairs, vec![("post", "author"), ("user", "best_friend")]);
  }

  #[test]
  fn test_unknown_relationship() {
    let schema = Schema::new().with_entity(EntityDescription::new("user"));
    assert!(matches!(
      schema.relationship("user", "friends"),
      Err(StoreError::UnknownRelationship { .. })
    ));
  }
}
