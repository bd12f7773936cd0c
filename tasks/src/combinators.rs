//! Settlement helpers for groups of tasks.
//!
//! - [`settle_all`]: drive a batch concurrently, keep every outcome.
//! - [`settled`]: drive a batch concurrently, collect values or report the
//!   first failure (in submission order) after everything has settled.
//! - [`first_matching`]: probe factories one at a time until a value passes
//!   a predicate.
//! - [`timeout`] / [`timeout_or`]: race a task against a deadline, settling
//!   the moment the deadline wins.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tracing::trace;

/// Runs all tasks concurrently and reports every outcome.
///
/// One task failing does not disturb the others. Outcomes are returned in
/// submission order regardless of completion order. An empty batch settles
/// immediately with an empty vector.
pub async fn settle_all<T, I, Fut>(tasks: I) -> Vec<Result<T>>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<T>>,
{
    futures::future::join_all(tasks).await
}

/// Runs all tasks concurrently, collecting values or the first failure.
///
/// Always waits for the whole batch, so no task is left running unobserved.
/// On failure the error reported is the earliest in *submission* order, even
/// if a later task failed sooner.
pub async fn settled<T, I, Fut>(tasks: I) -> Result<Vec<T>>
where
    I: IntoIterator<Item = Fut>,
    Fut: Future<Output = Result<T>>,
{
    let mut values = Vec::new();
    let mut first_error = None;
    for outcome in futures::future::join_all(tasks).await {
        match outcome {
            Ok(value) => values.push(value),
            Err(error) if first_error.is_none() => first_error = Some(error),
            Err(_) => {}
        }
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(values),
    }
}

/// Runs factories sequentially until one yields a value matching `predicate`.
///
/// Factories after the first match are never invoked. A factory error stops
/// the sequence and propagates. If the sequence is exhausted without a match
/// the `fallback` value is returned.
pub async fn first_matching<T, I, F, Fut, P>(factories: I, predicate: P, fallback: T) -> Result<T>
where
    I: IntoIterator<Item = F>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&T) -> bool,
{
    for factory in factories {
        let value = factory().await?;
        if predicate(&value) {
            return Ok(value);
        }
    }
    Ok(fallback)
}

/// Races `task` against a deadline.
///
/// If the deadline wins the task is dropped immediately and
/// [`Error::Timeout`] is returned; the caller is never left waiting for a
/// task that already lost.
pub async fn timeout<T, Fut>(duration: Duration, task: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, task).await {
        Ok(outcome) => outcome,
        Err(_) => {
            trace!("task lost deadline race after {duration:?}");
            Err(Error::Timeout(duration))
        }
    }
}

/// Like [`timeout`], but a lost race yields `default` instead of an error.
pub async fn timeout_or<T, Fut>(duration: Duration, task: Fut, default: T) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, task).await {
        Ok(outcome) => outcome,
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn eventually<T>(delay_ms: u64, outcome: Result<T>) -> Result<T> {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        outcome
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_all_keeps_submission_order() {
        // Completion order is reversed by the delays
        let outcomes = settle_all(vec![
            eventually(30, Ok(1)),
            eventually(20, Err(Error::failed(std::io::Error::other("middle")))),
            eventually(10, Ok(3)),
        ])
        .await;

        assert_eq!(outcomes.len(), 3);
        assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
        assert_eq!(outcomes[1].as_ref().unwrap_err().to_string(), "middle");
        assert_eq!(*outcomes[2].as_ref().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_settle_all_empty_batch() {
        let outcomes = settle_all(Vec::<std::future::Ready<Result<u32>>>::new()).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_collects_values() {
        let values = settled(vec![
            eventually(30, Ok("a")),
            eventually(10, Ok("b")),
            eventually(20, Ok("c")),
        ])
        .await
        .unwrap();
        assert_eq!(values, vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settled_reports_first_error_by_position() {
        // The positionally-first error completes last; it still wins
        let err = settled(vec![
            eventually(50, Err(Error::failed(std::io::Error::other("e1")))),
            eventually(10, Err(Error::failed(std::io::Error::other("e2")))),
            eventually(20, Ok(0)),
        ])
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "e1");
    }

    #[tokio::test]
    async fn test_first_matching_stops_at_match() {
        let calls = Arc::new(AtomicUsize::new(0));

        let factories: Vec<_> = [1u32, 4, 6]
            .into_iter()
            .map(|n| {
                let calls = calls.clone();
                move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(n) }
                }
            })
            .collect();

        let found = first_matching(factories, |n| n % 2 == 0, 0).await.unwrap();
        assert_eq!(found, 4);
        // The factory after the match is never invoked
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_matching_falls_back() {
        let factories: Vec<_> = [1u32, 3]
            .into_iter()
            .map(|n| move || async move { Ok(n) })
            .collect();

        let found = first_matching(factories, |n| *n > 100, 42).await.unwrap();
        assert_eq!(found, 42);
    }

    #[tokio::test]
    async fn test_first_matching_error_stops_sequence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        let c2 = calls.clone();
        let c3 = calls.clone();

        type Factory = Box<
            dyn FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<u32>> + Send>> + Send,
        >;
        let factories: Vec<Factory> = vec![
            Box::new(move || {
                c1.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(1) })
            }),
            Box::new(move || {
                c2.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Err(Error::failed(std::io::Error::other("probe failed"))) })
            }),
            Box::new(move || {
                c3.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(3) })
            }),
        ];

        let err = first_matching(factories, |n| *n > 1, 0).await.unwrap_err();
        assert_eq!(err.to_string(), "probe failed");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_expires() {
        let err = timeout(Duration::from_secs(1), eventually(60_000, Ok(1)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, Error::Timeout(d) if d == Duration::from_secs(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_passes_outcome_through() {
        assert_eq!(
            timeout(Duration::from_secs(5), eventually(10, Ok(11)))
                .await
                .unwrap(),
            11
        );

        let err = timeout(
            Duration::from_secs(5),
            eventually(10, Err::<u32, _>(Error::failed(std::io::Error::other("inner")))),
        )
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "inner");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_or_yields_default() {
        assert_eq!(
            timeout_or(Duration::from_secs(1), eventually(60_000, Ok(1)), 55)
                .await
                .unwrap(),
            55
        );
        assert_eq!(
            timeout_or(Duration::from_secs(1), eventually(10, Ok(1)), 55)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_zero_duration() {
        let err = timeout(Duration::ZERO, std::future::pending::<Result<u32>>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
