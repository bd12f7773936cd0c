//! Cancellation-aware task coordination for tokio applications.
//!
//! This crate collects the small scheduling primitives that interactive
//! services keep reinventing: cooperative cancellation with a strict
//! owner/observer split, throttling and debouncing of bursty work,
//! re-armable timers, opportunistic background computation, settlement
//! helpers for task groups, and a single-flight request cache.
//!
//! # Features
//!
//! - **CancellationSource / CancellationToken**: latched, one-way
//!   cancellation with read-only observers
//! - **CancelableTask**: a future that settles once, with cancellation
//!   beating natural completion on ties
//! - **Throttler / Delayer / ThrottledDelayer**: collapse bursts of work
//!   into at most one active and one pending run
//! - **RunOnceScheduler / TimeoutTimer / IntervalTimer**: re-armable timers
//!   that never fire after disarming
//! - **IdleValue**: exactly-once computation that starts on the blocking
//!   pool when a runtime is available
//! - **settle_all / settled / first_matching / timeout**: settlement
//!   combinators for groups of tasks
//! - **RequestCache**: keyed single-flight coalescing with refcounted
//!   interest and cancel-on-abandon
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::Throttler;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let throttler = Throttler::new();
//!
//! // A burst of refresh requests runs at most twice: once right away,
//! // once more for the requests that arrived mid-run
//! let refreshed = throttler.queue(|| async { reload().await });
//! refreshed.await.unwrap();
//! # });
//! # async fn reload() -> lariat_tasks::Result<()> { Ok(()) }
//! ```

pub mod error;

#[cfg(feature = "tokio")]
pub mod cancelable;
#[cfg(feature = "tokio")]
pub mod cancellation;
#[cfg(feature = "tokio")]
pub mod combinators;
#[cfg(feature = "tokio")]
pub mod delayer;
#[cfg(feature = "tokio")]
pub mod idle_value;
#[cfg(feature = "tokio")]
pub mod request_cache;
#[cfg(feature = "tokio")]
pub mod throttler;
#[cfg(feature = "tokio")]
pub mod timers;

// Re-export commonly used types at crate root
pub use error::{Error, Result};

#[cfg(feature = "tokio")]
pub use cancelable::{CancelHandle, CancelableTask};
#[cfg(feature = "tokio")]
pub use cancellation::{CancellationSource, CancellationToken};
#[cfg(feature = "tokio")]
pub use combinators::{first_matching, settle_all, settled, timeout, timeout_or};
#[cfg(feature = "tokio")]
pub use delayer::{Delayer, ThrottledDelayer};
#[cfg(feature = "tokio")]
pub use idle_value::IdleValue;
#[cfg(feature = "tokio")]
pub use request_cache::{Lease, RequestCache};
#[cfg(feature = "tokio")]
pub use throttler::Throttler;
#[cfg(feature = "tokio")]
pub use timers::{IntervalTimer, RunOnceScheduler, TimeoutTimer};
