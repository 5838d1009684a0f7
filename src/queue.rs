//! The ordered work queue.
//!
//! Every mutation of the identity map and the backing cache runs here, one job
//! at a time, in submission order. Transport calls happen outside the queue;
//! only their import phase is queued, so imports never race each other while
//! several requests are in flight.

use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::{StoreError, StoreResult};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a dedicated worker thread. The thread exits once every handle
/// is dropped and the queued jobs have run.
#[derive(Clone)]
pub struct WorkQueue {
  tx: mpsc::UnboundedSender<Job>,
}

impl WorkQueue {
  pub fn new(name: &str) -> StoreResult<Self> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Job>();

    thread::Builder::new()
      .name(name.to_string())
      .spawn(move || {
        while let Some(job) = rx.blocking_recv() {
          if catch_unwind(AssertUnwindSafe(job)).is_err() {
            error!("work queue job panicked");
          }
        }
        debug!("work queue drained");
      })
      .map_err(|e| StoreError::Storage(e.into()))?;

    Ok(Self { tx })
  }

  /// Enqueue `job` now and return a future resolving to its result.
  ///
  /// The job is queued at call time, not when the future is first polled,
  /// and runs even if the future is dropped.
  pub fn perform<T, F>(&self, job: F) -> impl Future<Output = StoreResult<T>> + Send + 'static
  where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
  {
    let (done, result) = oneshot::channel();
    let queued = self.tx.send(Box::new(move || {
      let _ = done.send(job());
    }));

    async move {
      queued.map_err(|_| StoreError::QueueClosed)?;
      // A panicking job drops `done` without sending
      result.await.map_err(|_| StoreError::QueueClosed)
    }
  }
}
