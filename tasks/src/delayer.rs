//! Trailing-edge debouncing of task submissions.
//!
//! A [`Delayer`] postpones work until its trigger has been quiet for a
//! configured delay. Every [`trigger()`](Delayer::trigger) during the quiet
//! period replaces the pending factory and restarts the countdown; when the
//! period finally elapses only the most recent factory runs, and every caller
//! that triggered during the period settles with that run's outcome.
//!
//! [`ThrottledDelayer`] chains a [`Delayer`] in front of a
//! [`Throttler`](crate::Throttler): bursts are first debounced, and whatever
//! survives the quiet period is then serialized against any run still in
//! flight.
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::Delayer;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let delayer = Delayer::new(Duration::from_millis(250));
//!
//! // Typing three characters in quick succession saves once
//! let _ = delayer.trigger(|| async { Ok(save("a").await) });
//! let _ = delayer.trigger(|| async { Ok(save("ab").await) });
//! let saved = delayer.trigger(|| async { Ok(save("abc").await) });
//! saved.await.unwrap();
//! # });
//! # async fn save(_: &str) {}
//! ```

use crate::error::{Error, Result};
use crate::throttler::Throttler;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Instrument, trace};

type Factory<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

struct Cycle<T> {
    factory: Factory<T>,
    waiters: Vec<tokio::sync::oneshot::Sender<Result<T>>>,
    generation: u64,
    sleeper: Option<tokio::task::AbortHandle>,
}

struct DelayState<T> {
    cycle: Option<Cycle<T>>,
    generation: u64,
}

struct DelayerInner<T> {
    state: spin::Mutex<DelayState<T>>,
}

/// Debounces task submissions, running only the latest after a quiet period.
///
/// A trigger that arrives while a previous run is already executing starts a
/// fresh cycle; the in-flight run is not affected and settles its own waiters.
///
/// Dropping the delayer cancels any pending cycle; its waiters settle with
/// [`Error::Cancelled`].
pub struct Delayer<T> {
    inner: Arc<DelayerInner<T>>,
    default_delay: Duration,
}

impl<T> Delayer<T> {
    /// Creates a delayer with the given default quiet period.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            inner: Arc::new(DelayerInner {
                state: spin::Mutex::new(DelayState {
                    cycle: None,
                    generation: 0,
                }),
            }),
            default_delay,
        }
    }

    /// Returns `true` while a cycle is pending (armed but not yet fired).
    ///
    /// A run that is already executing no longer counts as pending.
    pub fn is_triggered(&self) -> bool {
        self.inner.state.lock().cycle.is_some()
    }

    /// Cancels the pending cycle, if any.
    ///
    /// Pending waiters settle with [`Error::Cancelled`] and the factory is
    /// dropped uninvoked. A run that has already started is not affected.
    pub fn cancel(&self) {
        let cycle = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            state.cycle.take()
        };

        if let Some(cycle) = cycle {
            trace!("delayer: pending cycle cancelled");
            if let Some(sleeper) = cycle.sleeper {
                sleeper.abort();
            }
            for tx in cycle.waiters {
                let _ = tx.send(Err(Error::Cancelled));
            }
        }
    }
}

impl<T: Clone + Send + 'static> Delayer<T> {
    /// Triggers `factory` after the default quiet period.
    ///
    /// See [`trigger_after()`](Delayer::trigger_after).
    pub fn trigger<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.trigger_after(self.default_delay, factory)
    }

    /// Triggers `factory` after `delay` of quiet.
    ///
    /// If a cycle is already pending the factory replaces it, the caller
    /// joins its waiters and the countdown restarts at `delay`. The returned
    /// future settles with the outcome of whichever factory ultimately runs,
    /// or with [`Error::Cancelled`] if the cycle is cancelled first.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn trigger_after<F, Fut>(
        &self,
        delay: Duration,
        factory: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let factory: Factory<T> = Box::new(move || factory().boxed());
        let (tx, rx) = tokio::sync::oneshot::channel();

        let generation = {
            let mut state = self.inner.state.lock();
            state.generation = state.generation.wrapping_add(1);
            let generation = state.generation;
            match state.cycle.as_mut() {
                Some(cycle) => {
                    // Newest factory wins; earlier waiters ride along and the
                    // countdown restarts
                    cycle.factory = factory;
                    cycle.waiters.push(tx);
                    cycle.generation = generation;
                    if let Some(sleeper) = cycle.sleeper.take() {
                        sleeper.abort();
                    }
                }
                None => {
                    state.cycle = Some(Cycle {
                        factory,
                        waiters: vec![tx],
                        generation,
                        sleeper: None,
                    });
                }
            }
            generation
        };

        let sleeper = self.spawn_sleeper(delay, generation);
        {
            // Store the abort handle unless a newer trigger or a cancel has
            // superseded this cycle in the meantime. A handle that misses
            // its slot is harmless: the sleeper discards itself on the
            // generation check when it wakes.
            let mut state = self.inner.state.lock();
            match state.cycle.as_mut() {
                Some(cycle) if cycle.generation == generation => {
                    cycle.sleeper = Some(sleeper);
                }
                _ => {}
            }
        }

        async move { rx.await.unwrap_or(Err(Error::Cancelled)) }
    }

    fn spawn_sleeper(&self, delay: Duration, generation: u64) -> tokio::task::AbortHandle {
        let inner = self.inner.clone();
        let span = tracing::trace_span!(parent: None, "delayer_wait");
        span.follows_from(tracing::Span::current());
        tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                inner.fire(generation).await;
            }
            .instrument(span),
        )
        .abort_handle()
    }
}

impl<T: Clone + Send + 'static> DelayerInner<T> {
    async fn fire(self: Arc<Self>, generation: u64) {
        let cycle = {
            let mut state = self.state.lock();
            if state
                .cycle
                .as_ref()
                .is_some_and(|cycle| cycle.generation == generation)
            {
                state.cycle.take()
            } else {
                // A newer trigger re-armed the countdown; stand down
                None
            }
        };
        let Some(cycle) = cycle else { return };

        trace!("delayer: quiet period elapsed, running task");
        let task = (cycle.factory)();
        let outcome = task.await;
        for tx in cycle.waiters {
            let _ = tx.send(outcome.clone());
        }
    }
}

impl<T> Drop for Delayer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A [`Delayer`] whose fired tasks are additionally run through a
/// [`Throttler`].
///
/// Bursts of triggers debounce to a single task; if that task fires while a
/// previous one is still running it is buffered rather than run concurrently.
pub struct ThrottledDelayer<T> {
    delayer: Delayer<T>,
    throttler: Arc<Throttler<T>>,
}

impl<T: Clone + Send + 'static> ThrottledDelayer<T> {
    /// Creates a throttled delayer with the given default quiet period.
    pub fn new(default_delay: Duration) -> Self {
        Self {
            delayer: Delayer::new(default_delay),
            throttler: Arc::new(Throttler::new()),
        }
    }

    /// Triggers `factory` after the default quiet period.
    pub fn trigger<F, Fut>(&self, factory: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.trigger_after(self.delayer.default_delay, factory)
    }

    /// Triggers `factory` after `delay` of quiet, serializing the fired task
    /// behind any run still in flight.
    pub fn trigger_after<F, Fut>(
        &self,
        delay: Duration,
        factory: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let throttler = self.throttler.clone();
        self.delayer
            .trigger_after(delay, move || throttler.queue(factory))
    }

    /// Returns `true` while the debounce stage is pending.
    pub fn is_triggered(&self) -> bool {
        self.delayer.is_triggered()
    }

    /// Cancels the pending debounce cycle, if any.
    ///
    /// A task that has already passed to the throttle stage is not affected.
    pub fn cancel(&self) {
        self.delayer.cancel();
    }

    /// Disposes both stages.
    ///
    /// The pending cycle (if any) is cancelled, the active run (if any) is
    /// cancelled, and triggers that fire after this point settle with
    /// [`Error::Disposed`].
    pub fn dispose(&self) {
        self.delayer.cancel();
        self.throttler.dispose();
    }
}
