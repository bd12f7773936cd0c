//! Batch settlement and scheduling flows built from cancelable tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lariat_tasks::{CancelableTask, Error, RunOnceScheduler, Throttler, settle_all, settled};

#[tokio::test(start_paused = true)]
async fn test_settle_all_isolates_a_cancelled_sibling() {
    let keep = CancelableTask::new(|_token| async { Ok(1u32) });
    let doomed = CancelableTask::new(|_token| async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(2u32)
    });
    doomed.cancel();
    let tail = CancelableTask::new(|_token| async { Ok(3u32) });

    let outcomes = settle_all(vec![keep, doomed, tail]).await;
    assert_eq!(outcomes.len(), 3);
    assert_eq!(*outcomes[0].as_ref().unwrap(), 1);
    assert!(outcomes[1].as_ref().unwrap_err().is_cancelled());
    assert_eq!(*outcomes[2].as_ref().unwrap(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_flushes_run_through_the_throttler() {
    let throttler: Arc<Throttler<u32>> = Arc::new(Throttler::new());
    let flushes = Arc::new(AtomicUsize::new(0));
    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();

    let scheduler = {
        let throttler = throttler.clone();
        let flushes = flushes.clone();
        RunOnceScheduler::new(
            move || {
                let flushes = flushes.clone();
                let waiter = throttler.queue(move || {
                    flushes.fetch_add(1, Ordering::SeqCst);
                    async { Ok(0u32) }
                });
                let done_tx = done_tx.clone();
                tokio::spawn(async move {
                    let _ = done_tx.send(waiter.await);
                });
            },
            Duration::from_millis(20),
        )
    };

    scheduler.schedule();
    assert!(scheduler.is_scheduled());
    assert_eq!(done_rx.recv().await.unwrap().unwrap(), 0);

    scheduler.schedule();
    assert_eq!(done_rx.recv().await.unwrap().unwrap(), 0);

    assert_eq!(flushes.load(Ordering::SeqCst), 2);
    assert!(!scheduler.is_scheduled());
}

#[tokio::test]
async fn test_settled_fails_a_batch_on_the_first_failure() {
    let outcome = settled(vec![
        CancelableTask::new(|_token| async { Ok(1u32) }),
        CancelableTask::new(|_token| async {
            Err(Error::failed(std::io::Error::other("broken pipe")))
        }),
        CancelableTask::new(|_token| async { Ok(3u32) }),
    ])
    .await;

    assert_eq!(outcome.unwrap_err().to_string(), "broken pipe");
}
