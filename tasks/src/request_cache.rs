//! Single-flight request coalescing with refcounted interest.
//!
//! A [`RequestCache`] deduplicates expensive keyed requests. The first
//! [`acquire()`](RequestCache::acquire) for a key invokes the factory and
//! drives it on a background task; further acquires for the same key join
//! the in-flight request instead of starting their own. Every acquire returns a [`Lease`]
//! registering the caller's interest: when the last lease for an unresolved
//! request is released the request is cancelled and evicted, so no work
//! keeps running for an audience that has left.
//!
//! Successful outcomes are retained and served to later acquires without
//! re-running the factory, until [`invalidate()`](RequestCache::invalidate)
//! or [`shutdown()`](RequestCache::shutdown). Failures are never retained.
//!
//! Factories receive a [`CancellationToken`] and should wind down promptly
//! when it fires; the flight settles as cancelled either way. A factory that
//! reports [`Error::Cancelled`] while nobody asked for cancellation is
//! treated as spurious and retried a bounded number of times
//! ([`Config::spurious_retry_limit`]).
//!
//! # Example
//!
//! ```no_run
//! use lariat_tasks::RequestCache;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let cache: RequestCache<String, u64> = RequestCache::new();
//!
//! let lease = cache.acquire("stats/main.rs".to_string(), |token| async move {
//!     tokio::select! {
//!         _ = token.cancelled_owned() => Err(lariat_tasks::Error::Cancelled),
//!         v = compute_stats() => Ok(v),
//!     }
//! });
//!
//! let stats = lease.outcome().await;
//! # });
//! # async fn compute_stats() -> u64 { 0 }
//! ```

use crate::cancelable::CancelableTask;
use crate::cancellation::{CancellationSource, CancellationToken};
use crate::error::{Error, Result};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::{HashMap, hash_map};
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{Instrument, debug, trace};

type Outcome<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Tuning for a [`RequestCache`].
#[derive(Debug, Clone)]
pub struct Config {
    /// How many times a flight that settles [`Error::Cancelled`] without a
    /// matching cancellation request is restarted before the cancellation
    /// is accepted as the outcome.
    pub spurious_retry_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            spurious_retry_limit: 1,
        }
    }
}

struct Entry<T> {
    epoch: u64,
    refs: usize,
    resolved: bool,
    source: CancellationSource,
    outcome: Outcome<T>,
}

struct CacheInner<K, T> {
    entries: spin::Mutex<HashMap<K, Entry<T>>>,
    config: Config,
    epochs: AtomicU64,
    disposed: AtomicBool,
    tracker: tokio_util::task::TaskTracker,
}

/// Coalesces concurrent requests per key and caches successful outcomes.
///
/// Dropping the cache cancels every in-flight request; prefer
/// [`shutdown()`](RequestCache::shutdown) when you need to wait for the
/// flights to finish winding down.
pub struct RequestCache<K, T> {
    inner: Arc<CacheInner<K, T>>,
}

impl<K, T> RequestCache<K, T> {
    /// Creates a cache with the default [`Config`].
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a cache with explicit tuning.
    pub fn with_config(config: Config) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: spin::Mutex::new(HashMap::new()),
                config,
                epochs: AtomicU64::new(0),
                disposed: AtomicBool::new(false),
                tracker: tokio_util::task::TaskTracker::new(),
            }),
        }
    }

    /// Number of entries, in-flight and resolved.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.lock().is_empty()
    }

    /// Cancels every in-flight request, drops all entries and waits for the
    /// background flights to finish. Later acquires settle with
    /// [`Error::Disposed`].
    pub async fn shutdown(&self) {
        self.inner.disposed.store(true, Ordering::Release);
        let entries = core::mem::take(&mut *self.inner.entries.lock());
        for entry in entries.into_values() {
            if !entry.resolved {
                entry.source.cancel();
            }
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}

impl<K, T> RequestCache<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Acquires a lease on the request for `key`.
    ///
    /// If the key has no entry the factory is invoked before `acquire`
    /// returns and its task is driven to settlement on a background flight.
    /// If a request is in flight, or already resolved, the caller joins it
    /// and the factory is dropped uninvoked. Await the settlement through
    /// [`Lease::outcome()`].
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn acquire<F, Fut>(&self, key: K, factory: F) -> Lease<K, T>
    where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Lease {
                cache: self.inner.clone(),
                key,
                epoch: 0,
                outcome: futures::future::ready(Err(Error::Disposed)).boxed().shared(),
                released: true,
            };
        }

        let mut entries = self.inner.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.refs += 1;
            trace!("request cache: joined existing request");
            let epoch = entry.epoch;
            let outcome = entry.outcome.clone();
            drop(entries);
            return Lease {
                cache: self.inner.clone(),
                key,
                epoch,
                outcome,
                released: false,
            };
        }

        let epoch = self.inner.epochs.fetch_add(1, Ordering::Relaxed);
        let source = CancellationSource::new();
        let token = source.token();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let outcome: Outcome<T> = async move { rx.await.unwrap_or(Err(Error::Cancelled)) }
            .boxed()
            .shared();

        entries.insert(
            key.clone(),
            Entry {
                epoch,
                refs: 1,
                resolved: false,
                source,
                outcome: outcome.clone(),
            },
        );
        drop(entries);

        trace!("request cache: starting request");
        let first = CancelableTask::with_parent(&token, &factory);
        self.spawn_flight(key.clone(), epoch, token, factory, first, tx);

        Lease {
            cache: self.inner.clone(),
            key,
            epoch,
            outcome,
            released: false,
        }
    }

    /// Drops the entry for `key`, cancelling it if still in flight.
    ///
    /// Holders of existing leases settle with [`Error::Cancelled`] unless
    /// the request had already resolved. The next acquire starts fresh.
    pub fn invalidate(&self, key: &K) {
        let removed = self.inner.entries.lock().remove(key);
        if let Some(entry) = removed {
            if entry.resolved {
                trace!("request cache: dropped resolved entry");
            } else {
                debug!("request cache: invalidated in-flight request");
                entry.source.cancel();
            }
        }
    }

    fn spawn_flight<F, Fut>(
        &self,
        key: K,
        epoch: u64,
        token: CancellationToken,
        factory: F,
        first: CancelableTask<T>,
        tx: tokio::sync::oneshot::Sender<Result<T>>,
    ) where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let inner = self.inner.clone();
        let span = tracing::trace_span!(parent: None, "request_flight");
        span.follows_from(tracing::Span::current());
        self.inner.tracker.spawn(
            async move { inner.drive(key, epoch, token, factory, first, tx).await }
                .instrument(span),
        );
    }
}

impl<K, T> Default for RequestCache<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Drop for RequestCache<K, T> {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        let entries = core::mem::take(&mut *self.inner.entries.lock());
        for entry in entries.into_values() {
            if !entry.resolved {
                entry.source.cancel();
            }
        }
        self.inner.tracker.close();
    }
}

impl<K, T> CacheInner<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn drive<F, Fut>(
        self: Arc<Self>,
        key: K,
        epoch: u64,
        token: CancellationToken,
        factory: F,
        first: CancelableTask<T>,
        tx: tokio::sync::oneshot::Sender<Result<T>>,
    ) where
        F: Fn(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        // The first attempt was constructed in acquire(); only spurious
        // retries re-invoke the factory here.
        let mut pending = Some(first);
        let mut retries = 0;
        let outcome = loop {
            if token.is_cancelled() {
                // Interest was withdrawn before this attempt started
                break Err(Error::Cancelled);
            }
            let attempt = pending
                .take()
                .unwrap_or_else(|| CancelableTask::with_parent(&token, &factory));
            match attempt.await {
                Err(Error::Cancelled)
                    if !token.is_cancelled() && retries < self.config.spurious_retry_limit =>
                {
                    retries += 1;
                    debug!(retries, "request cache: spurious cancellation, retrying");
                }
                outcome => break outcome,
            }
        };

        {
            let mut entries = self.entries.lock();
            // An entry with a different epoch belongs to a successor; leave it
            if let hash_map::Entry::Occupied(slot) = entries.entry(key) {
                if slot.get().epoch == epoch {
                    if outcome.is_ok() {
                        slot.into_mut().resolved = true;
                    } else {
                        // Failures are never retained
                        slot.remove();
                    }
                }
            }
        }

        let _ = tx.send(outcome);
    }
}

impl<K: Eq + Hash, T> CacheInner<K, T> {
    fn release(&self, key: &K, epoch: u64) {
        let to_cancel = {
            let mut entries = self.entries.lock();
            let abandoned = match entries.get_mut(key) {
                Some(entry) if entry.epoch == epoch => {
                    entry.refs = entry.refs.saturating_sub(1);
                    entry.refs == 0 && !entry.resolved
                }
                // Stale lease: its entry was evicted, possibly replaced
                _ => false,
            };
            if abandoned { entries.remove(key) } else { None }
        };

        if let Some(entry) = to_cancel {
            debug!("request cache: last lease released, cancelling request");
            entry.source.cancel();
        }
    }
}

/// A caller's registered interest in one request.
///
/// The lease releases its interest when dropped or via
/// [`release()`](Lease::release). Outcome futures obtained before release
/// stay valid; if the release cancels the request they settle with
/// [`Error::Cancelled`].
pub struct Lease<K: Eq + Hash, T> {
    cache: Arc<CacheInner<K, T>>,
    key: K,
    epoch: u64,
    outcome: Outcome<T>,
    released: bool,
}

impl<K: Eq + Hash, T: Clone> Lease<K, T> {
    /// The key this lease is attached to.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// A future settling with the request's outcome.
    ///
    /// Can be called any number of times; every future observes the same
    /// settlement.
    pub fn outcome(&self) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + Sync + 'static,
    {
        self.outcome.clone()
    }

    /// Releases this lease's interest.
    ///
    /// Equivalent to dropping, but explicit at call sites where the release
    /// has consequences (the last lease on an unresolved request cancels
    /// it).
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release(&self.key, self.epoch);
        }
    }
}

impl<K: Eq + Hash, T> Drop for Lease<K, T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release(&self.key, self.epoch);
        }
    }
}
