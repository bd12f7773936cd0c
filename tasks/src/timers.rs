//! Re-armable timers for callback-style scheduling.
//!
//! Three small primitives over [`tokio::time`]:
//!
//! - [`RunOnceScheduler`]: one fixed runner, re-armable; scheduling again
//!   before the deadline restarts the countdown.
//! - [`TimeoutTimer`]: one-shot with a per-arm runner; [`set()`](TimeoutTimer::set)
//!   replaces any armed timer, [`set_if_not_set()`](TimeoutTimer::set_if_not_set)
//!   arms only when idle.
//! - [`IntervalTimer`]: repeats a runner at a fixed period until cancelled.
//!
//! All three guarantee that a disarmed timer never fires: cancellation aborts
//! the sleeping task, and a sleeper that was already waking discards itself
//! against a generation counter before running anything.

use std::sync::Arc;
use std::time::Duration;
use trace_err::*;
use tracing::{Instrument, trace};

struct TimerState {
    generation: u64,
    armed: Option<tokio::task::AbortHandle>,
    disposed: bool,
}

impl TimerState {
    fn new() -> Self {
        Self {
            generation: 0,
            armed: None,
            disposed: false,
        }
    }

    // Bumping the generation strands any sleeper that has already woken
    // but not yet passed its fence check
    fn disarm(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        if let Some(armed) = self.armed.take() {
            armed.abort();
        }
    }
}

/// Runs a fixed callback once, a delay after the most recent `schedule()`.
///
/// The runner is supplied at construction and shared by every arming, so the
/// scheduler can be re-armed indefinitely. Scheduling while armed restarts
/// the countdown; the runner fires at most once per arming.
pub struct RunOnceScheduler {
    inner: Arc<RunOnceInner>,
    default_delay: Duration,
}

struct RunOnceInner {
    runner: std::sync::Mutex<Box<dyn FnMut() + Send>>,
    state: spin::Mutex<TimerState>,
}

impl RunOnceScheduler {
    /// Creates a scheduler that will invoke `runner` after the default delay.
    pub fn new(runner: impl FnMut() + Send + 'static, default_delay: Duration) -> Self {
        Self {
            inner: Arc::new(RunOnceInner {
                runner: std::sync::Mutex::new(Box::new(runner)),
                state: spin::Mutex::new(TimerState::new()),
            }),
            default_delay,
        }
    }

    /// Arms (or re-arms) the timer with the default delay.
    pub fn schedule(&self) {
        self.schedule_after(self.default_delay);
    }

    /// Arms (or re-arms) the timer with an explicit delay.
    ///
    /// If already armed the previous countdown is discarded and a fresh one
    /// starts at `delay`. No-op after [`dispose()`](RunOnceScheduler::dispose).
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn schedule_after(&self, delay: Duration) {
        let generation = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return;
            }
            state.disarm();
            state.generation
        };

        let inner = self.inner.clone();
        let span = tracing::trace_span!(parent: None, "run_once_wait");
        span.follows_from(tracing::Span::current());
        let sleeper = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                inner.fire(generation);
            }
            .instrument(span),
        )
        .abort_handle();

        let mut state = self.inner.state.lock();
        if !state.disposed && state.generation == generation {
            state.armed = Some(sleeper);
        }
        // Otherwise a newer arming superseded us; the sleeper will fail its
        // fence check if it ever wakes
    }

    /// Disarms the timer if armed. The runner is kept for later schedules.
    pub fn cancel(&self) {
        self.inner.state.lock().disarm();
    }

    /// Returns `true` while armed and not yet fired.
    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().armed.is_some()
    }

    /// Disarms the timer and ignores all further schedules. Idempotent.
    pub fn dispose(&self) {
        let mut state = self.inner.state.lock();
        state.disposed = true;
        state.disarm();
    }
}

impl RunOnceInner {
    fn fire(&self, generation: u64) {
        {
            let mut state = self.state.lock();
            if state.disposed || state.generation != generation {
                return;
            }
            state.armed = None;
        }

        trace!("run-once timer fired");
        let mut runner = self.runner.lock().trace_expect("Failed to lock mutex");
        (*runner)();
    }
}

impl Drop for RunOnceScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A one-shot timer with a replaceable deadline and runner.
///
/// Unlike [`RunOnceScheduler`] the runner travels with each arming, so
/// successive arms can do different work.
pub struct TimeoutTimer {
    inner: Arc<TimeoutInner>,
}

struct TimeoutInner {
    state: spin::Mutex<TimerState>,
}

impl TimeoutTimer {
    /// Creates an idle timer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TimeoutInner {
                state: spin::Mutex::new(TimerState::new()),
            }),
        }
    }

    /// Arms the timer, replacing any armed deadline and runner.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn set(&self, delay: Duration, runner: impl FnOnce() + Send + 'static) {
        self.arm(delay, runner, true);
    }

    /// Arms the timer only if it is not already armed.
    ///
    /// If armed this is a true no-op: the existing deadline and runner stand
    /// and `runner` is dropped uninvoked.
    pub fn set_if_not_set(&self, delay: Duration, runner: impl FnOnce() + Send + 'static) {
        self.arm(delay, runner, false);
    }

    fn arm<R: FnOnce() + Send + 'static>(&self, delay: Duration, runner: R, reset: bool) {
        let generation = {
            let mut state = self.inner.state.lock();
            if !reset && state.armed.is_some() {
                return;
            }
            state.disarm();
            state.generation
        };

        let inner = self.inner.clone();
        let span = tracing::trace_span!(parent: None, "timeout_wait");
        span.follows_from(tracing::Span::current());
        let sleeper = tokio::spawn(
            async move {
                tokio::time::sleep(delay).await;
                let fire = {
                    let mut state = inner.state.lock();
                    if state.generation == generation {
                        state.armed = None;
                        true
                    } else {
                        false
                    }
                };
                if fire {
                    trace!("timeout timer fired");
                    runner();
                }
            }
            .instrument(span),
        )
        .abort_handle();

        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.armed = Some(sleeper);
        }
    }

    /// Disarms the timer if armed. Idempotent.
    pub fn cancel(&self) {
        self.inner.state.lock().disarm();
    }
}

impl Default for TimeoutTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Repeats a runner at a fixed period until cancelled or dropped.
pub struct IntervalTimer {
    inner: Arc<IntervalInner>,
}

struct IntervalInner {
    state: spin::Mutex<TimerState>,
}

impl IntervalTimer {
    /// Creates an idle timer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(IntervalInner {
                state: spin::Mutex::new(TimerState::new()),
            }),
        }
    }

    /// Starts invoking `runner` every `period`, replacing any running
    /// schedule. The first invocation happens one full period from now.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero or if called outside a tokio runtime.
    pub fn set(&self, period: Duration, mut runner: impl FnMut() + Send + 'static) {
        let generation = {
            let mut state = self.inner.state.lock();
            state.disarm();
            state.generation
        };

        let inner = self.inner.clone();
        let span = tracing::trace_span!(parent: None, "interval_tick");
        span.follows_from(tracing::Span::current());
        let ticker = tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The first tick completes immediately
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if inner.state.lock().generation != generation {
                        return;
                    }
                    runner();
                }
            }
            .instrument(span),
        )
        .abort_handle();

        let mut state = self.inner.state.lock();
        if state.generation == generation {
            state.armed = Some(ticker);
        }
    }

    /// Stops the schedule if one is running. Idempotent.
    pub fn cancel(&self) {
        self.inner.state.lock().disarm();
    }
}

impl Default for IntervalTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IntervalTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
