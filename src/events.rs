//! Lifecycle events for remote operations.
//!
//! Each remote operation publishes exactly two events, `Started` then
//! `Finished`, to every observer registered on the store. Observers run
//! synchronously on the publishing task, in registration order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::transport::{RemoteOperation, TransportError};

/// Identifies the logical context that issued an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub(crate) u64);

impl ContextId {
  pub fn as_u64(&self) -> u64 {
    self.0
  }
}

impl fmt::Display for ContextId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ctx#{}", self.0)
  }
}

/// How a remote operation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  Succeeded,
  Failed(TransportError),
  /// Abandoned before the transport call resolved
  Cancelled,
}

impl fmt::Display for Outcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Outcome::Succeeded => f.write_str("succeeded"),
      Outcome::Failed(e) => write!(f, "failed: {}", e),
      Outcome::Cancelled => f.write_str("cancelled"),
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
  Started {
    context: ContextId,
    operation: RemoteOperation,
  },
  Finished {
    context: ContextId,
    operation: RemoteOperation,
    outcome: Outcome,
  },
}

impl StoreEvent {
  pub fn context(&self) -> ContextId {
    match self {
      StoreEvent::Started { context, .. } | StoreEvent::Finished { context, .. } => *context,
    }
  }

  pub fn operation(&self) -> &RemoteOperation {
    match self {
      StoreEvent::Started { operation, .. } | StoreEvent::Finished { operation, .. } => operation,
    }
  }
}

/// Receives lifecycle events.
pub trait StoreObserver: Send + Sync {
  fn on_event(&self, event: &StoreEvent);
}

impl<F> StoreObserver for F
where
  F: Fn(&StoreEvent) + Send + Sync,
{
  fn on_event(&self, event: &StoreEvent) {
    self(event)
  }
}

/// Returned by [`Observers::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

/// The set of registered observers.
#[derive(Default)]
pub struct Observers {
  next_id: AtomicU64,
  subscribers: RwLock<Vec<(Subscription, Arc<dyn StoreObserver>)>>,
}

impl Observers {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn subscribe(&self, observer: impl StoreObserver + 'static) -> Subscription {
    let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .subscribers
      .write()
      .unwrap_or_else(|e| e.into_inner())
      .push((subscription, Arc::new(observer)));
    subscription
  }

  /// Returns false if the subscription was not registered.
  pub fn unsubscribe(&self, subscription: Subscription) -> bool {
    let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
    let before = subscribers.len();
    subscribers.retain(|(s, _)| *s != subscription);
    subscribers.len() != before
  }

  pub fn len(&self) -> usize {
    self
      .subscribers
      .read()
      .map(|s| s.len())
      .unwrap_or_default()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn publish(&self, event: StoreEvent) {
    match &event {
      StoreEvent::Started { context, operation } => {
        debug!(%context, %operation, "remote operation started");
      }
      StoreEvent::Finished {
        context,
        operation,
        outcome: outcome @ Outcome::Failed(_),
      } => {
        warn!(%context, %operation, %outcome, "remote operation finished");
      }
      StoreEvent::Finished {
        context,
        operation,
        outcome,
      } => {
        debug!(%context, %operation, %outcome, "remote operation finished");
      }
    }

    // Snapshot so observers may subscribe or unsubscribe from inside a callback
    let subscribers: Vec<Arc<dyn StoreObserver>> = self
      .subscribers
      .read()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, o)| o.clone())
      .collect();

    for observer in subscribers {
      observer.on_event(&event);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Mutex;

  fn delete_op() -> RemoteOperation {
    RemoteOperation::Delete {
      entity: "user".into(),
      resource_identifier: "1".into(),
    }
  }

  #[test]
  fn test_observers_receive_events_in_order_until_unsubscribed() {
    let observers = Observers::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    let subscription = observers.subscribe(move |event: &StoreEvent| {
      sink.lock().unwrap().push(event.clone());
    });
    assert_eq!(observers.len(), 1);

    let context = ContextId(3);
    observers.publish(StoreEvent::Started {
      context,
      operation: delete_op(),
    });
    observers.publish(StoreEvent::Finished {
      context,
      operation: delete_op(),
      outcome: Outcome::Succeeded,
    });

    assert!(observers.unsubscribe(subscription));
    assert!(!observers.unsubscribe(subscription));
    observers.publish(StoreEvent::Started {
      context,
      operation: delete_op(),
    });

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(matches!(seen[0], StoreEvent::Started { .. }));
    assert!(matches!(
      seen[1],
      StoreEvent::Finished {
        outcome: Outcome::Succeeded,
        ..
      }
    ));
    assert_eq!(seen[1].context(), context);
    assert_eq!(seen[1].operation().method(), "delete");
  }
}
