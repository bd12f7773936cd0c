//! Shared error and result types for all coordination primitives.
//!
//! Every primitive in this crate settles with the same [`Result`] type, so an
//! outcome can be fanned out to any number of waiters. To make that possible
//! [`Error`] is `Clone`: underlying failures are reference-counted rather than
//! owned.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// The reason a coordinated task did not produce a value.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The task was cancelled before it settled naturally.
    ///
    /// Emitted when a caller cancels explicitly, when a debounced or queued
    /// task is superseded before it runs, or when the last interested party
    /// walks away from a coalesced request.
    #[error("task cancelled")]
    Cancelled,

    /// The task lost a race against a deadline.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    /// The owning primitive was disposed before the task could be accepted.
    #[error("primitive disposed")]
    Disposed,

    /// The underlying work itself failed.
    ///
    /// The original error is shared behind an [`Arc`] so that a single failure
    /// can be delivered to every waiter coalesced onto the same run.
    #[error(transparent)]
    Failed(#[from] Arc<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps an arbitrary error as [`Error::Failed`].
    pub fn failed(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(error))
    }

    /// Returns `true` for [`Error::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Returns `true` for [`Error::Timeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_shares_source() {
        let e = Error::failed(std::io::Error::other("disk on fire"));
        let e2 = e.clone();

        let (Error::Failed(a), Error::Failed(b)) = (&e, &e2) else {
            panic!("expected Failed");
        };
        assert!(Arc::ptr_eq(a, b));
        assert_eq!(e2.to_string(), "disk on fire");
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_timeout());
        assert!(Error::Timeout(Duration::from_millis(5)).is_timeout());
        assert!(!Error::Disposed.is_cancelled());
    }
}
