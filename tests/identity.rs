mod common;

use common::{always_remote, harness, ScriptedTransport};
use incstore::{ChangeSet, FetchRequest, ResourceIdentifier, ResourceKey};
use serde_json::json;

#[test]
fn test_resolve_and_lookup_are_inverse() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let store = &h.store;

  let pairs = [("user", "1"), ("user", "2"), ("post", "1"), ("post", "x-9")];
  let identities: Vec<_> = pairs
    .iter()
    .map(|(entity, id)| store.resolve_identity(entity, &ResourceIdentifier::from(*id)))
    .collect();

  for ((entity, id), identity) in pairs.iter().zip(&identities) {
    assert_eq!(store.resolve_identity(entity, &(*id).into()), *identity);
    assert_eq!(
      store.lookup_identity(*identity).unwrap(),
      ResourceKey::new(*entity, (*id).into())
    );
  }

  let mut unique = identities.clone();
  unique.sort();
  unique.dedup();
  assert_eq!(unique.len(), pairs.len());
}

#[tokio::test]
async fn test_import_reuses_resolved_identity() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let known = h.store.resolve_identity("user", &"7".into());

  h.transport.push_ok(json!([{"id": "7", "name": "Ann"}]));
  let fetched = h.store.context().fetch(FetchRequest::new("user")).await.unwrap();
  assert_eq!(fetched.data, vec![known]);
}

#[tokio::test]
async fn test_contexts_share_one_identity_map() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let first = h.store.context();
  let second = h.store.context();

  h.transport.push_ok(json!([{"id": "1"}]));
  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  let a = first.fetch(FetchRequest::new("user")).await.unwrap().data;
  let b = second.fetch(FetchRequest::new("user")).await.unwrap().data;
  assert_eq!(a, b);
  assert_eq!(first.read_row(a[0]).unwrap().attribute("name"), Some(&json!("Ann")));
}

#[tokio::test]
async fn test_placeholders_are_distinct_until_promoted() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  let a = ctx.insert("user", ChangeSet::new()).await.unwrap().identity();
  let b = ctx.insert("user", ChangeSet::new()).await.unwrap().identity();
  assert_ne!(a, b);

  let key = h.store.lookup_identity(a).unwrap();
  assert_ne!(key, h.store.lookup_identity(b).unwrap());
  assert!(h.store.is_placeholder(a).unwrap());
  assert_eq!(h.store.resolve_identity("user", &key.resource_identifier), a);
}
