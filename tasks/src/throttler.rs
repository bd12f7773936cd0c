//! Run coalescing: at most one active run, at most one buffered run.
//!
//! A [`Throttler`] accepts any number of concurrent [`queue()`](Throttler::queue)
//! calls but never runs more than one task at a time. While a run is active a
//! single buffer slot holds the *latest* queued factory; queueing again
//! overwrites the slot, and every caller buffered behind the same slot settles
//! with the outcome of whichever factory ultimately runs.
//!
//! This is the classic pattern for expensive refresh work: the first request
//! starts immediately, a burst of requests arriving mid-run collapses into a
//! single trailing run, and nobody is left without an answer.
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::Throttler;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let throttler = Throttler::new();
//!
//! // Each burst of queue() calls produces at most one trailing refresh
//! let refreshed = throttler.queue(|| async { Ok(load_state().await) });
//! let outcome = refreshed.await;
//! # });
//! # async fn load_state() -> u32 { 0 }
//! ```

use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tracing::{Instrument, trace};

type Factory<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

enum Phase {
    Idle,
    Running,
}

struct QueuedRun<T> {
    factory: Factory<T>,
    waiters: Vec<tokio::sync::oneshot::Sender<Result<T>>>,
}

struct State<T> {
    phase: Phase,
    queued: Option<QueuedRun<T>>,
    disposed: bool,
}

struct Inner<T> {
    state: spin::Mutex<State<T>>,
    cancel: tokio_util::sync::CancellationToken,
    tracker: tokio_util::task::TaskTracker,
}

/// Serializes overlapping task submissions into at most two runs.
///
/// `queue()` decides synchronously whether the factory starts now or is
/// buffered, so ordering between concurrent callers is well defined. Dropping
/// the throttler disposes it: the active run is cancelled and buffered
/// waiters settle with [`Error::Cancelled`].
pub struct Throttler<T> {
    inner: Arc<Inner<T>>,
}

enum Action<T> {
    Start(Factory<T>, Vec<tokio::sync::oneshot::Sender<Result<T>>>),
    Buffered,
    Rejected(tokio::sync::oneshot::Sender<Result<T>>),
}

// Restores the phase machine if a run unwinds instead of settling. Must be
// disarmed on every normal exit: a late reset would race a successor run.
struct PhaseReset<'a, T> {
    inner: &'a Inner<T>,
    disarmed: bool,
}

impl<T> Drop for PhaseReset<'_, T> {
    fn drop(&mut self) {
        if self.disarmed {
            return;
        }
        let flushed = {
            let mut state = self.inner.state.lock();
            state.phase = Phase::Idle;
            state.queued.take()
        };
        if let Some(run) = flushed {
            for tx in run.waiters {
                let _ = tx.send(Err(Error::Cancelled));
            }
        }
    }
}

impl<T> Throttler<T> {
    /// Creates an idle throttler.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: spin::Mutex::new(State {
                    phase: Phase::Idle,
                    queued: None,
                    disposed: false,
                }),
                cancel: tokio_util::sync::CancellationToken::new(),
                tracker: tokio_util::task::TaskTracker::new(),
            }),
        }
    }

    /// Disposes the throttler.
    ///
    /// The active run (if any) is cancelled and its waiters settle with
    /// [`Error::Cancelled`], as do any buffered waiters. Later `queue()`
    /// calls settle with [`Error::Disposed`]. Idempotent.
    pub fn dispose(&self) {
        let buffered = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.queued.take()
        };

        self.inner.cancel.cancel();
        if let Some(run) = buffered {
            for tx in run.waiters {
                let _ = tx.send(Err(Error::Cancelled));
            }
        }
    }
}

impl<T: Clone + Send + 'static> Throttler<T> {
    /// Queues `factory` for execution, coalescing with any active run.
    ///
    /// - Idle: the factory is invoked synchronously and its future runs on a
    ///   background task.
    /// - Running: the factory replaces the buffer slot and the caller joins
    ///   the slot's waiters. Exactly one buffered run starts when the active
    ///   run settles.
    ///
    /// The returned future settles with the outcome of the run this caller
    /// was attached to. A task that panics cancels its waiters, current and
    /// buffered, and the throttler returns to idle.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn queue<F, Fut>(
        &self,
        factory: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static + use<T, F, Fut>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let factory: Factory<T> = Box::new(move || factory().boxed());
        let (tx, rx) = tokio::sync::oneshot::channel();

        let action = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                Action::Rejected(tx)
            } else {
                match state.phase {
                    Phase::Running => {
                        match state.queued.as_mut() {
                            Some(run) => {
                                // Overwrite the buffered factory, keep its waiters
                                run.factory = factory;
                                run.waiters.push(tx);
                            }
                            None => {
                                state.queued = Some(QueuedRun {
                                    factory,
                                    waiters: vec![tx],
                                });
                            }
                        }
                        Action::Buffered
                    }
                    Phase::Idle => {
                        state.phase = Phase::Running;
                        Action::Start(factory, vec![tx])
                    }
                }
            }
        };

        match action {
            Action::Start(factory, waiters) => {
                trace!("throttler: starting run");
                self.inner.clone().spawn_run(factory, waiters);
            }
            Action::Buffered => {
                trace!("throttler: buffered behind active run");
            }
            Action::Rejected(tx) => {
                let _ = tx.send(Err(Error::Disposed));
            }
        }

        async move { rx.await.unwrap_or(Err(Error::Cancelled)) }
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    fn spawn_run(
        self: Arc<Self>,
        factory: Factory<T>,
        waiters: Vec<tokio::sync::oneshot::Sender<Result<T>>>,
    ) {
        // Invoke synchronously so side effects happen at the start decision
        let task = {
            let mut reset = PhaseReset {
                inner: &self,
                disarmed: false,
            };
            let task = factory();
            reset.disarmed = true;
            task
        };

        let span = tracing::trace_span!(parent: None, "throttler_run");
        span.follows_from(tracing::Span::current());
        self.tracker
            .clone()
            .spawn(async move { self.drive(task, waiters).await }.instrument(span));
    }

    async fn drive(
        self: Arc<Self>,
        mut task: BoxFuture<'static, Result<T>>,
        mut waiters: Vec<tokio::sync::oneshot::Sender<Result<T>>>,
    ) {
        // A panicking task unwinds this future; current waiters settle through
        // their dropped senders, buffered ones through the guard.
        let mut reset = PhaseReset {
            inner: &self,
            disarmed: false,
        };
        loop {
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(Error::Cancelled),
                outcome = &mut task => outcome,
            };

            for tx in waiters.drain(..) {
                let _ = tx.send(outcome.clone());
            }

            if self.cancel.is_cancelled() {
                // Disposed; dispose() has already flushed the buffer slot
                reset.disarmed = true;
                return;
            }

            let next = {
                let mut state = self.state.lock();
                match state.queued.take() {
                    Some(run) => Some(run),
                    None => {
                        state.phase = Phase::Idle;
                        None
                    }
                }
            };

            match next {
                Some(run) => {
                    trace!("throttler: starting buffered run");
                    task = (run.factory)();
                    waiters = run.waiters;
                }
                None => {
                    reset.disarmed = true;
                    return;
                }
            }
        }
    }
}

impl<T> Default for Throttler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for Throttler<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
