//! Source/token split for cooperative cancellation.
//!
//! This module separates the authority to *request* cancellation from the
//! ability to *observe* it. A [`CancellationSource`] is held by whoever owns
//! the work; any number of [`CancellationToken`]s can be handed to the work
//! itself, and none of them can trigger cancellation.
//!
//! Cancellation is one-way and latched: once requested it can never be
//! rescinded, repeated requests are no-ops, and a token that subscribes after
//! the fact observes the request immediately.
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::CancellationSource;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let source = CancellationSource::new();
//! let token = source.token();
//!
//! tokio::spawn(async move {
//!     token.cancelled_owned().await;
//!     println!("Cancelled!");
//! });
//!
//! source.cancel();
//! # });
//! ```

use std::future::Future;

/// The owning half of a cancellation pair.
///
/// Dropping the source does *not* cancel outstanding tokens; it merely drops
/// the authority to do so. Tokens already handed out simply never resolve.
#[derive(Debug)]
pub struct CancellationSource {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationSource {
    /// Creates a new, uncancelled source.
    pub fn new() -> Self {
        Self {
            inner: tokio_util::sync::CancellationToken::new(),
        }
    }

    pub(crate) fn from_raw(inner: tokio_util::sync::CancellationToken) -> Self {
        Self { inner }
    }

    /// Requests cancellation.
    ///
    /// Idempotent: the first call latches the state, later calls do nothing.
    /// Every live and future [`CancellationToken`] of this source observes
    /// the request.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Returns `true` once [`cancel()`](CancellationSource::cancel) has been
    /// called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Creates a read-only token observing this source.
    ///
    /// Tokens are cheap to create and clone; hand one to each piece of work
    /// that should notice the request.
    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.clone(),
        }
    }
}

impl Default for CancellationSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A read-only view of a [`CancellationSource`].
///
/// Tokens can observe cancellation but never request it, so passing a token
/// into untrusted work cannot cancel sibling listeners.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: tokio_util::sync::CancellationToken,
}

impl CancellationToken {
    pub(crate) fn raw(&self) -> &tokio_util::sync::CancellationToken {
        &self.inner
    }

    /// Returns `true` once the source has requested cancellation.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes when the source requests cancellation.
    ///
    /// If cancellation was already requested the future completes on first
    /// poll. If the source is dropped without cancelling, the future never
    /// completes.
    pub fn cancelled(&self) -> impl Future<Output = ()> + '_ {
        self.inner.cancelled()
    }

    /// Like [`cancelled()`](CancellationToken::cancelled) but consumes the
    /// token, yielding a `'static` future suitable for moving into a spawned
    /// task or a `select!` arm that outlives the borrow.
    pub fn cancelled_owned(self) -> impl Future<Output = ()> + Send + 'static {
        self.inner.cancelled_owned()
    }

    /// Creates a token that is cancelled when this one is.
    pub fn child(&self) -> CancellationToken {
        CancellationToken {
            inner: self.inner.child_token(),
        }
    }
}
