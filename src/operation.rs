//! Cancellable handles for in-flight fetches and saves.

use std::future::Future;
use std::panic;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{StoreError, StoreResult};

/// A running store operation.
///
/// Await it for the result. [`cancel`](Self::cancel) abandons the operation
/// if its transport call has not resolved yet; a fetch then leaves the cache
/// untouched and resolves to [`StoreError::Cancelled`]. A save whose remote
/// call already completed is still reconciled locally. Dropping the handle
/// does not cancel anything.
pub struct Operation<T> {
  handle: JoinHandle<StoreResult<T>>,
  token: CancellationToken,
}

impl<T: Send + 'static> Operation<T> {
  pub(crate) fn spawn<F>(token: CancellationToken, work: F) -> Self
  where
    F: Future<Output = StoreResult<T>> + Send + 'static,
  {
    Self {
      handle: tokio::spawn(work),
      token,
    }
  }

  /// An operation that already finished.
  pub(crate) fn ready(result: StoreResult<T>) -> Self {
    Self::spawn(CancellationToken::new(), async move { result })
  }
}

impl<T> Operation<T> {
  pub fn cancel(&self) {
    self.token.cancel();
  }

  /// Token that cancels this operation from elsewhere, such as an observer.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.token.clone()
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  pub fn is_finished(&self) -> bool {
    self.handle.is_finished()
  }
}

impl<T> Future for Operation<T> {
  type Output = StoreResult<T>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    match Pin::new(&mut self.handle).poll(cx) {
      Poll::Pending => Poll::Pending,
      Poll::Ready(Ok(result)) => Poll::Ready(result),
      Poll::Ready(Err(e)) if e.is_panic() => panic::resume_unwind(e.into_panic()),
      Poll::Ready(Err(_)) => Poll::Ready(Err(StoreError::Cancelled)),
    }
  }
}
