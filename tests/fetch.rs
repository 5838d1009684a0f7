mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{always_remote, harness, harness_with_storage, ScriptedTransport};
use incstore::{
  CacheSource, FetchRequest, Freshness, Outcome, Predicate, RelatedObjects, RelationshipValue,
  RemoteOperation, SqliteStorage, StoreConfig, StoreError, StoreEvent, TransportError,
  TransportErrorKind,
};
use serde_json::json;

#[tokio::test]
async fn test_fetch_then_query_merges_with_existing_rows() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "2", "email": "bob@x.com"}]));
  let first = ctx.fetch(FetchRequest::new("user")).await.unwrap();
  assert_eq!(first.source, CacheSource::Network);
  let bob = first.data[0];

  h.transport.push_ok(json!([
    {"id": "1", "name": "Ann"},
    {"id": "2", "name": "Bob"},
    {"id": "3", "name": "Cid"},
  ]));
  let second = ctx.fetch(FetchRequest::new("user")).await.unwrap();
  assert_eq!(second.data.len(), 3);
  assert_eq!(second.data[1], bob);

  let rows = h.store.query_local(&FetchRequest::new("user")).unwrap();
  assert_eq!(rows.len(), 3);
  let merged = h.store.read_row(bob).unwrap();
  assert_eq!(merged.attribute("name"), Some(&json!("Bob")));
  assert_eq!(merged.attribute("email"), Some(&json!("bob@x.com")));
}

#[tokio::test]
async fn test_narrow_fetch_does_not_erase_wide_fields() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1", "name": "A"}]));
  h.transport.push_ok(json!([{"id": "1", "email": "a@x.com"}]));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let result = ctx.fetch(FetchRequest::new("user")).await.unwrap();

  let row = ctx.read_row(result.data[0]).unwrap();
  assert_eq!(row.attribute("name"), Some(&json!("A")));
  assert_eq!(row.attribute("email"), Some(&json!("a@x.com")));
}

#[tokio::test]
async fn test_cyclic_representation_imports_two_rows() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!({
    "id": "x",
    "name": "X",
    "best_friend": {"id": "y", "name": "Y", "best_friend": {"id": "x"}}
  }));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();

  let rows = h.store.query_local(&FetchRequest::new("user")).unwrap();
  assert_eq!(rows.len(), 2);
  assert_eq!(
    rows[0].relationship("best_friend"),
    Some(&RelationshipValue::ToOne(Some("y".into())))
  );
  assert_eq!(
    rows[1].relationship("best_friend"),
    Some(&RelationshipValue::ToOne(Some("x".into())))
  );
  assert_eq!(rows[0].attribute("name"), Some(&json!("X")));
}

#[tokio::test]
async fn test_failed_import_leaves_no_row_from_the_response() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!([
    {"id": "1", "name": "A"},
    {"id": "2", "best_friend": [{"id": "3"}, {"id": "4"}]},
    {"id": "5"},
  ]));
  let err = ctx.fetch(FetchRequest::new("user")).await.unwrap_err();
  match err {
    StoreError::CardinalityMismatch { relationship, .. } => assert_eq!(relationship, "best_friend"),
    other => panic!("expected cardinality mismatch, got {:?}", other),
  }
  assert!(h.store.query_local(&FetchRequest::new("user")).unwrap().is_empty());
}

#[tokio::test]
async fn test_non_empty_policy_answers_from_cache() {
  let h = harness(ScriptedTransport::new(), StoreConfig::new(Freshness::NonEmpty));
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  let first = ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let second = ctx.fetch(FetchRequest::new("user")).await.unwrap();

  assert_eq!(first.source, CacheSource::Network);
  assert_eq!(second.source, CacheSource::Cache);
  assert_eq!(first.data, second.data);
  assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn test_stale_after_uses_the_fetch_log_per_request() {
  let config = StoreConfig::new(Freshness::stale_after(Duration::from_secs(300)));
  let h = harness(ScriptedTransport::new(), config);
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let cached = ctx.fetch(FetchRequest::new("user")).await.unwrap();
  assert_eq!(cached.source, CacheSource::Cache);
  assert_eq!(h.transport.call_count(), 1);

  // A different query was never fetched, even though its rows are cached
  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  let filtered = FetchRequest::new("user").filter(Predicate::eq("name", "Ann"));
  let result = ctx.fetch(filtered).await.unwrap();
  assert_eq!(result.source, CacheSource::Network);
  assert_eq!(h.transport.call_count(), 2);
}

#[tokio::test]
async fn test_remote_failure_degrades_to_cached_rows_when_enabled() {
  let h = harness(ScriptedTransport::new(), always_remote().degrade_on_failure(true));
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  h.transport.push(Err(TransportError::network("connection refused")));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let result = ctx.fetch(FetchRequest::new("user")).await.unwrap();

  assert!(result.is_offline());
  assert_eq!(result.data.len(), 1);
  assert_eq!(result.notice.unwrap().kind, TransportErrorKind::Network);
}

#[tokio::test]
async fn test_remote_failure_surfaces_without_degrade_or_without_data() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();
  h.transport.push_ok(json!([{"id": "1"}]));
  h.transport.push(Err(TransportError::timeout("slow")));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let err = ctx.fetch(FetchRequest::new("user")).await.unwrap_err();
  assert!(matches!(err, StoreError::Transport(ref e) if e.kind == TransportErrorKind::Timeout));

  let degrading = harness(ScriptedTransport::new(), always_remote().degrade_on_failure(true));
  degrading.transport.push(Err(TransportError::network("down")));
  let err = degrading
    .store
    .context()
    .fetch(FetchRequest::new("user"))
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::Transport(_)));
}

#[tokio::test]
async fn test_unparseable_body_is_a_transport_failure() {
  let h = harness(ScriptedTransport::new(), always_remote().degrade_on_failure(true));
  let ctx = h.store.context();
  h.transport.push_ok(json!([{"id": "1"}]));
  h.transport.push_ok(json!("not a representation"));

  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  let result = ctx.fetch(FetchRequest::new("user")).await.unwrap();
  assert!(result.is_offline());
  assert_eq!(result.notice.unwrap().kind, TransportErrorKind::Parse);
}

#[tokio::test]
async fn test_cancelled_fetch_leaves_cache_untouched() {
  let transport = ScriptedTransport::new().with_delay(Duration::from_secs(30));
  transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  let h = harness(transport, always_remote());
  let ctx = h.store.context();

  let operation = ctx.fetch(FetchRequest::new("user"));
  h.transport.wait_for_calls(1).await;
  operation.cancel();

  assert!(matches!(operation.await, Err(StoreError::Cancelled)));
  assert!(h.store.query_local(&FetchRequest::new("user")).unwrap().is_empty());

  let events = h.events.lock().unwrap().clone();
  assert_eq!(events.len(), 2);
  assert!(matches!(
    &events[1],
    StoreEvent::Finished {
      outcome: Outcome::Cancelled,
      ..
    }
  ));
}

#[tokio::test]
async fn test_each_remote_call_emits_started_then_finished() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();
  let other = h.store.context();
  assert_ne!(ctx.id(), other.id());

  h.transport.push_ok(json!([]));
  h.transport.push(Err(TransportError::rejected("500")));
  ctx.fetch(FetchRequest::new("user")).await.unwrap();
  other.fetch(FetchRequest::new("post")).await.unwrap_err();

  let events = h.events.lock().unwrap().clone();
  assert_eq!(events.len(), 4);
  assert!(matches!(&events[0], StoreEvent::Started { context, .. } if *context == ctx.id()));
  assert!(matches!(
    &events[1],
    StoreEvent::Finished { context, outcome: Outcome::Succeeded, .. } if *context == ctx.id()
  ));
  assert!(matches!(&events[2], StoreEvent::Started { context, .. } if *context == other.id()));
  assert!(matches!(
    &events[3],
    StoreEvent::Finished { outcome: Outcome::Failed(_), .. }
  ));
  assert_eq!(events[2].operation().entity(), "post");
}

#[tokio::test]
async fn test_unknown_entity_fails_before_any_remote_call() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let err = h
    .store
    .context()
    .fetch(FetchRequest::new("ghost"))
    .await
    .unwrap_err();
  assert!(matches!(err, StoreError::UnknownEntity(_)));
  assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test]
async fn test_relationship_traversal_fetches_once_then_answers_locally() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1", "name": "Ann"}]));
  let ann = ctx.fetch(FetchRequest::new("user")).await.unwrap().data[0];

  h.transport.push_ok(json!([
    {"id": "p1", "title": "First", "author": "1"},
    {"id": "p2", "title": "Second", "author": "1"},
  ]));
  let remote = ctx.relationship_value(ann, "posts").await.unwrap();
  assert_eq!(remote.source, CacheSource::Network);
  let posts = match &remote.data {
    RelatedObjects::Many(posts) => posts.clone(),
    other => panic!("expected to-many, got {:?}", other),
  };
  assert_eq!(posts.len(), 2);
  assert_eq!(
    h.transport.calls()[1],
    RemoteOperation::FetchRelationship {
      entity: "user".into(),
      resource_identifier: "1".into(),
      relationship: "posts".into(),
    }
  );

  let local = ctx.relationship_value(ann, "posts").await.unwrap();
  assert_eq!(local.source, CacheSource::Cache);
  assert_eq!(local.data, remote.data);
  assert_eq!(h.transport.call_count(), 2);

  // The author reference resolves to the same identity without another call
  let author = ctx.relationship_value(posts[0], "author").await.unwrap();
  assert_eq!(author.data, RelatedObjects::One(Some(ann)));
  assert_eq!(h.transport.call_count(), 2);
}

#[tokio::test]
async fn test_to_one_relationship_response_with_many_objects_is_rejected() {
  let h = harness(ScriptedTransport::new(), always_remote());
  let ctx = h.store.context();

  h.transport.push_ok(json!([{"id": "1"}]));
  let ann = ctx.fetch(FetchRequest::new("user")).await.unwrap().data[0];

  h.transport.push_ok(json!([{"id": "2"}, {"id": "3"}]));
  let err = ctx.relationship_value(ann, "best_friend").await.unwrap_err();
  assert!(matches!(err, StoreError::CardinalityMismatch { .. }));
  assert_eq!(h.store.query_local(&FetchRequest::new("user")).unwrap().len(), 1);
}

#[tokio::test]
async fn test_sqlite_cache_survives_a_new_session() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("cache.db");

  {
    let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
    let h = harness_with_storage(ScriptedTransport::new(), always_remote(), storage);
    h.transport.push_ok(json!([
      {"id": "1", "name": "Ann", "posts": [{"id": "p1", "title": "Hello"}]},
      {"id": "2", "name": "Bob"},
    ]));
    h.store.context().fetch(FetchRequest::new("user")).await.unwrap();
  }

  let storage = Arc::new(SqliteStorage::open_at(&path).unwrap());
  let h = harness_with_storage(
    ScriptedTransport::new(),
    StoreConfig::new(Freshness::LocalOnly),
    storage,
  );
  let ctx = h.store.context();

  let request = FetchRequest::new("user").filter(Predicate::eq("name", "Ann"));
  let result = ctx.fetch(request).await.unwrap();
  assert_eq!(result.source, CacheSource::Cache);
  assert_eq!(result.data.len(), 1);

  let ann = ctx.read_row(result.data[0]).unwrap();
  assert_eq!(
    ann.relationship("posts"),
    Some(&RelationshipValue::ToMany(vec!["p1".into()]))
  );
  assert_eq!(h.store.query_local(&FetchRequest::new("post")).unwrap().len(), 1);
  assert_eq!(h.transport.call_count(), 0);
}

#[tokio::test]
async fn test_in_flight_limit_of_one_serialises_fetches() {
  let transport =
    ScriptedTransport::responding(|_| Ok(json!([]))).with_delay(Duration::from_millis(50));
  let h = harness(transport, always_remote().max_in_flight(1));

  let users = h.store.context().fetch(FetchRequest::new("user"));
  let posts = h.store.context().fetch(FetchRequest::new("post"));
  users.await.unwrap();
  posts.await.unwrap();

  assert_eq!(h.transport.call_count(), 2);
  assert_eq!(h.transport.peak_in_flight(), 1);
}

#[tokio::test]
async fn test_fetches_overlap_up_to_the_in_flight_limit() {
  let transport =
    ScriptedTransport::responding(|_| Ok(json!([]))).with_delay(Duration::from_millis(50));
  let h = harness(transport, always_remote().max_in_flight(4));

  let pending: Vec<_> = (0..3)
    .map(|_| h.store.context().fetch(FetchRequest::new("user")))
    .collect();
  for operation in pending {
    operation.await.unwrap();
  }
  assert_eq!(h.transport.peak_in_flight(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_readers_never_see_a_partial_import() {
  let users: Vec<_> = (0..200)
    .map(|i| json!({"id": i.to_string(), "name": format!("user {}", i)}))
    .collect();
  let transport = ScriptedTransport::new().with_delay(Duration::from_millis(20));
  transport.push_ok(json!(users));
  let h = harness(transport, always_remote());

  let operation = h.store.context().fetch(FetchRequest::new("user"));
  let request = FetchRequest::new("user");
  while !operation.is_finished() {
    let seen = h.store.query_local(&request).unwrap().len();
    assert!(seen == 0 || seen == 200, "reader saw {} rows", seen);
    tokio::time::sleep(Duration::from_millis(1)).await;
  }

  assert_eq!(operation.await.unwrap().data.len(), 200);
  assert_eq!(h.store.query_local(&request).unwrap().len(), 200);
}
