//! End-to-end flows chaining the debounce, throttle, and request-cache
//! stages the way a language service drives them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lariat_tasks::{CancellationToken, RequestCache, ThrottledDelayer};

#[tokio::test(start_paused = true)]
async fn test_edit_burst_parses_once() {
    let parses = Arc::new(AtomicUsize::new(0));
    let cache: Arc<RequestCache<&'static str, String>> = Arc::new(RequestCache::new());
    let debouncer: ThrottledDelayer<String> = ThrottledDelayer::new(Duration::from_millis(50));

    // Three rapid edits: the debounce stage keeps only the newest factory,
    // and the cache shares the single parse it starts.
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let cache = cache.clone();
            let parses = parses.clone();
            debouncer.trigger(move || async move {
                let lease = cache.acquire("main.rs", move |_token| {
                    parses.fetch_add(1, Ordering::SeqCst);
                    async { Ok("outline".to_string()) }
                });
                let outcome = lease.outcome().await;
                lease.release();
                outcome
            })
        })
        .collect();

    for waiter in waiters {
        assert_eq!(waiter.await.unwrap(), "outline");
    }
    assert_eq!(parses.load(Ordering::SeqCst), 1);

    // The resolved parse stays cached for the next acquire
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_closing_the_document_cancels_the_parse() {
    let cache: RequestCache<&'static str, u32> = RequestCache::new();
    let observed: Arc<std::sync::Mutex<Option<CancellationToken>>> = Arc::default();

    let slot = observed.clone();
    let lease = cache.acquire("closed.rs", move |token| {
        *slot.lock().unwrap() = Some(token);
        std::future::pending::<lariat_tasks::Result<u32>>()
    });
    let outcome = lease.outcome();
    tokio::task::yield_now().await;

    // Last lease released while the parse is still running
    lease.release();
    assert!(outcome.await.unwrap_err().is_cancelled());

    let token = observed.lock().unwrap().clone().unwrap();
    assert!(token.is_cancelled());
    assert!(cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_parse_outlives_an_impatient_caller() {
    let cache: RequestCache<&'static str, u32> = RequestCache::new();
    let gate = Arc::new(tokio::sync::Notify::new());

    let opened = gate.clone();
    let lease = cache.acquire("slow.rs", move |_token| {
        let opened = opened.clone();
        async move {
            opened.notified().await;
            Ok(7)
        }
    });

    // Giving up on a waiter future abandons nothing but that caller's
    // interest; the lease keeps the flight alive.
    let err = lariat_tasks::timeout(Duration::from_millis(10), lease.outcome())
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(cache.len(), 1);

    gate.notify_one();
    assert_eq!(lease.outcome().await.unwrap(), 7);
    lease.release();
}
