//! Cancellable wrapper around a unit of async work.
//!
//! [`CancelableTask`] couples a future with its own [`CancellationSource`].
//! The factory building the future receives a [`CancellationToken`] so the
//! work can wind down cooperatively, but the task settles as
//! [`Error::Cancelled`] as soon as cancellation is requested whether the
//! underlying future cooperates or not.
//!
//! Settlement is final: whichever happens first, natural completion or
//! cancellation, decides the outcome and later events cannot change it.
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::CancelableTask;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let task = CancelableTask::new(|token| async move {
//!     tokio::select! {
//!         _ = token.cancelled_owned() => Err(lariat_tasks::Error::Cancelled),
//!         _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => Ok(42),
//!     }
//! });
//!
//! let cancel = task.handle();
//! tokio::spawn(async move { cancel.cancel() });
//!
//! let outcome = task.await;
//! assert!(outcome.is_err());
//! # });
//! ```

use crate::cancellation::{CancellationSource, CancellationToken};
use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// A future that can be cancelled by its owner or any [`CancelHandle`].
///
/// The task settles exactly once:
/// - with the underlying future's output, if it completes first, or
/// - with [`Error::Cancelled`], if cancellation is requested first.
///
/// A cancellation request that arrives in the same scheduling round as
/// natural completion wins: the cancellation branch is polled first.
///
/// Dropping an unsettled task requests cancellation so that cooperative
/// sub-work holding the token does not run on unobserved.
pub struct CancelableTask<T> {
    inner: BoxFuture<'static, Result<T>>,
    cancel_wait: BoxFuture<'static, ()>,
    source: CancellationSource,
    settled: bool,
}

impl<T> CancelableTask<T> {
    /// Builds a task from `factory`, invoking it immediately.
    ///
    /// The factory runs synchronously inside `new()`; only the future it
    /// returns is deferred. It receives a token observing this task's own
    /// cancellation source.
    pub fn new<F, Fut>(factory: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_source(CancellationSource::new(), factory)
    }

    /// Builds a task whose cancellation source is a child of `parent`.
    ///
    /// Cancelling `parent` cancels this task; cancelling this task leaves
    /// `parent` untouched.
    pub fn with_parent<F, Fut>(parent: &CancellationToken, factory: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_source(
            CancellationSource::from_raw(parent.raw().child_token()),
            factory,
        )
    }

    fn with_source<F, Fut>(source: CancellationSource, factory: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let cancel_wait = source.token().cancelled_owned();
        Self {
            inner: factory(source.token()).boxed(),
            cancel_wait: cancel_wait.boxed(),
            source,
            settled: false,
        }
    }

    /// Requests cancellation.
    ///
    /// Idempotent. If the task has already settled this only signals the
    /// token; the recorded outcome does not change.
    pub fn cancel(&self) {
        self.source.cancel();
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.source.is_cancelled()
    }

    /// Returns a detachable handle that can cancel this task.
    pub fn handle(&self) -> CancelHandle {
        CancelHandle {
            inner: self.source.token(),
        }
    }
}

impl<T> Future for CancelableTask<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.settled {
            panic!("CancelableTask polled after settlement");
        }

        // Cancellation is checked first so a request racing natural
        // completion settles the task as cancelled.
        if this.cancel_wait.as_mut().poll(cx).is_ready() {
            this.settled = true;
            return Poll::Ready(Err(Error::Cancelled));
        }

        match this.inner.as_mut().poll(cx) {
            Poll::Ready(outcome) => {
                this.settled = true;
                Poll::Ready(outcome)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for CancelableTask<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.source.cancel();
        }
    }
}

/// Cancels an associated [`CancelableTask`] from afar.
///
/// Handles are cheap to clone and remain valid after the task settles or is
/// dropped; late cancellation requests are no-ops.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    inner: CancellationToken,
}

impl CancelHandle {
    /// Requests cancellation of the associated task.
    pub fn cancel(&self) {
        self.inner.raw().cancel();
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }
}
