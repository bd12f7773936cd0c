//! Exactly-once computation that starts opportunistically in the background.
//!
//! An [`IdleValue`] wraps a synchronous factory. When created inside a tokio
//! runtime the factory is handed to the blocking pool immediately, so by the
//! time anyone asks for the value it is often already there. Asking before
//! the background run got around to it computes on the caller's thread
//! instead. Either way the factory runs exactly once and its outcome, success
//! or failure, is cached and replayed to every caller.
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::IdleValue;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let parsed = IdleValue::new(|| Ok(expensive_parse()));
//!
//! // Some time later, usually precomputed by now
//! let value = parsed.value()?;
//! # lariat_tasks::Result::Ok(())
//! # });
//! # fn expensive_parse() -> u64 { 42 }
//! ```

use crate::error::Result;
use std::sync::Arc;
use trace_err::*;

struct IdleState<T> {
    factory: Option<Box<dyn FnOnce() -> Result<T> + Send>>,
    outcome: Option<Result<T>>,
}

struct IdleShared<T> {
    state: std::sync::Mutex<IdleState<T>>,
}

impl<T: Clone> IdleShared<T> {
    fn force(&self) -> Result<T> {
        let mut state = self.state.lock().trace_expect("Failed to lock mutex");
        if state.outcome.is_none() {
            let factory = state
                .factory
                .take()
                .trace_expect("Factory consumed without outcome");
            state.outcome = Some(factory());
        }
        state.outcome.clone().trace_expect("Outcome just computed")
    }
}

/// A lazily-forced value that precomputes on the blocking pool when possible.
///
/// [`value()`](IdleValue::value) blocks the calling thread for at most one
/// factory run; once computed it is a cache lookup. Created outside a tokio
/// runtime the background run is skipped and the value is purely lazy.
pub struct IdleValue<T> {
    shared: Arc<IdleShared<T>>,
    background: spin::Mutex<Option<tokio::task::AbortHandle>>,
}

impl<T: Clone + Send + 'static> IdleValue<T> {
    /// Wraps `factory`, starting a background computation if a runtime is
    /// available.
    pub fn new(factory: impl FnOnce() -> Result<T> + Send + 'static) -> Self {
        let shared = Arc::new(IdleShared {
            state: std::sync::Mutex::new(IdleState {
                factory: Some(Box::new(factory)),
                outcome: None,
            }),
        });

        let background = tokio::runtime::Handle::try_current().ok().map(|handle| {
            let shared = shared.clone();
            let span = tracing::trace_span!(parent: None, "idle_compute");
            span.follows_from(tracing::Span::current());
            handle
                .spawn_blocking(move || {
                    span.in_scope(|| {
                        let _ = shared.force();
                    })
                })
                .abort_handle()
        });

        Self {
            shared,
            background: spin::Mutex::new(background),
        }
    }

    /// Returns the computed value, forcing the computation if it has not
    /// happened yet.
    ///
    /// Concurrent callers serialize on the computation; all of them observe
    /// the same outcome instance.
    pub fn value(&self) -> Result<T> {
        self.shared.force()
    }
}

impl<T> IdleValue<T> {
    /// Returns `true` once the factory has run.
    pub fn is_computed(&self) -> bool {
        self.shared
            .state
            .lock()
            .trace_expect("Failed to lock mutex")
            .outcome
            .is_some()
    }

    /// Withdraws the background computation if it has not started.
    ///
    /// Best effort: a background run that is already executing completes and
    /// caches its outcome as usual. [`value()`](IdleValue::value) keeps
    /// working after disposal.
    pub fn dispose(&self) {
        if let Some(handle) = self.background.lock().take() {
            handle.abort();
        }
    }
}

impl<T> Drop for IdleValue<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_computes_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value = IdleValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        });

        assert_eq!(value.value().unwrap(), 99);
        assert_eq!(value.value().unwrap(), 99);
        assert!(value.is_computed());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_replayed_identically() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value: IdleValue<u32> = IdleValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Err(Error::failed(std::io::Error::other("parse failed")))
        });

        let (Error::Failed(a), Error::Failed(b)) =
            (value.value().unwrap_err(), value.value().unwrap_err())
        else {
            panic!("expected Failed");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_computes_without_value_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value = IdleValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok("precomputed")
        });

        // Real time: the blocking pool runs on its own thread
        for _ in 0..500 {
            if value.is_computed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(value.is_computed());
        assert_eq!(value.value().unwrap(), "precomputed");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispose_keeps_value_usable() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value = IdleValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });

        value.dispose();
        value.dispose();

        assert_eq!(value.value().unwrap(), 7);
        assert_eq!(value.value().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_outside_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let value = IdleValue::new(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
            Ok(3)
        });

        assert!(!value.is_computed());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(value.value().unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
