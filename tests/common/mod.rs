#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use incstore::{
  EntityDescription, Freshness, IncrementalStore, MemoryStorage, RemoteOperation, RowStorage,
  Schema, StoreConfig, StoreEvent, Transport, TransportError,
};
use serde_json::Value;

type Responder = Box<dyn Fn(&RemoteOperation) -> Result<Value, TransportError> + Send + Sync>;

/// In-process transport answering from a script and recording every call.
pub struct ScriptedTransport {
  queued: Mutex<VecDeque<Result<Value, TransportError>>>,
  fallback: Option<Responder>,
  delay: Mutex<Option<Duration>>,
  calls: Mutex<Vec<RemoteOperation>>,
  in_flight: AtomicUsize,
  peak_in_flight: AtomicUsize,
}

impl ScriptedTransport {
  pub fn new() -> Self {
    Self {
      queued: Mutex::new(VecDeque::new()),
      fallback: None,
      delay: Mutex::new(None),
      calls: Mutex::new(Vec::new()),
      in_flight: AtomicUsize::new(0),
      peak_in_flight: AtomicUsize::new(0),
    }
  }

  /// Answer every call not covered by a queued response with `responder`.
  pub fn responding(
    responder: impl Fn(&RemoteOperation) -> Result<Value, TransportError> + Send + Sync + 'static,
  ) -> Self {
    Self {
      fallback: Some(Box::new(responder)),
      ..Self::new()
    }
  }

  pub fn with_delay(self, delay: Duration) -> Self {
    self.set_delay(delay);
    self
  }

  /// Hold every later call for `delay` before answering.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Queue a response for the next call.
  pub fn push(&self, response: Result<Value, TransportError>) {
    self.queued.lock().unwrap().push_back(response);
  }

  pub fn push_ok(&self, body: Value) {
    self.push(Ok(body));
  }

  pub fn calls(&self) -> Vec<RemoteOperation> {
    self.calls.lock().unwrap().clone()
  }

  /// Most calls ever held open at once.
  pub fn peak_in_flight(&self) -> usize {
    self.peak_in_flight.load(Ordering::SeqCst)
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  /// Wait until at least `n` calls have reached the transport.
  pub async fn wait_for_calls(&self, n: usize) {
    for _ in 0..500 {
      if self.call_count() >= n {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("transport saw {} calls, expected {}", self.call_count(), n);
  }
}

#[async_trait]
impl Transport for ScriptedTransport {
  async fn request(&self, operation: &RemoteOperation) -> Result<Value, TransportError> {
    self.calls.lock().unwrap().push(operation.clone());
    let open = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    self.peak_in_flight.fetch_max(open, Ordering::SeqCst);

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }
    self.in_flight.fetch_sub(1, Ordering::SeqCst);

    let queued = self.queued.lock().unwrap().pop_front();
    match (queued, &self.fallback) {
      (Some(response), _) => response,
      (None, Some(responder)) => responder(operation),
      (None, None) => Err(TransportError::network(format!(
        "no scripted response for {}",
        operation
      ))),
    }
  }
}

/// `user` and `post`, with relationships in both directions.
pub fn schema() -> Schema {
  Schema::new()
    .with_entity(
      EntityDescription::new("user")
        .attribute("name")
        .attribute("email")
        .to_many("posts", "post")
        .to_one("best_friend", "user"),
    )
    .with_entity(
      EntityDescription::new("post")
        .attribute("title")
        .attribute("body")
        .to_one("author", "user"),
    )
}

pub struct Harness {
  pub store: IncrementalStore,
  pub transport: Arc<ScriptedTransport>,
  pub events: Arc<Mutex<Vec<StoreEvent>>>,
}

pub fn harness(transport: ScriptedTransport, config: StoreConfig) -> Harness {
  harness_with_storage(transport, config, Arc::new(MemoryStorage::new()))
}

pub fn harness_with_storage(
  transport: ScriptedTransport,
  config: StoreConfig,
  storage: Arc<dyn RowStorage>,
) -> Harness {
  let transport = Arc::new(transport);
  let store = IncrementalStore::builder(schema(), storage, transport.clone(), config)
    .build()
    .unwrap();

  let events = Arc::new(Mutex::new(Vec::new()));
  let sink = events.clone();
  store.subscribe(move |event: &StoreEvent| sink.lock().unwrap().push(event.clone()));

  Harness {
    store,
    transport,
    events,
  }
}

pub fn always_remote() -> StoreConfig {
  StoreConfig::new(Freshness::AlwaysRemote)
}
