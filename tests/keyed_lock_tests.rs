//! Integration tests for `KeyedLock`.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use catalog_core::sync::{KeyedLock, LockError};
use parking_lot::Mutex;
use rstest::rstest;

// =============================================================================
// Mutual Exclusion
// =============================================================================

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_callers_on_book_42_never_overlap() {
    let locks = KeyedLock::<String>::new();
    let intervals = Arc::new(Mutex::new(Vec::new()));
    let clock = Arc::new(AtomicU64::new(0));

    let mut handles = Vec::new();
    for _ in 0..2 {
        let locks = locks.clone();
        let intervals = Arc::clone(&intervals);
        let clock = Arc::clone(&clock);
        handles.push(tokio::spawn(async move {
            let _guard = locks.acquire("book-42".to_string()).await;
            let entered = clock.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let exited = clock.fetch_add(1, Ordering::SeqCst);
            intervals.lock().push((entered, exited));
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut intervals = intervals.lock().clone();
    intervals.sort_unstable();
    assert_eq!(intervals.len(), 2);
    assert_eq!(intervals[0].1 + 1, intervals[1].0);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acquirers_of_one_key_are_strictly_serialized() {
    const ACQUIRERS: u64 = 32;
    let locks = KeyedLock::<&'static str>::new();
    let counter = Arc::new(AtomicU64::new(0));
    let holders = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..ACQUIRERS {
        let locks = locks.clone();
        let counter = Arc::clone(&counter);
        let holders = Arc::clone(&holders);
        handles.push(tokio::spawn(async move {
            let _guard = locks.acquire("counter").await;
            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
            let read = counter.load(Ordering::SeqCst);
            tokio::task::yield_now().await;
            counter.store(read + 1, Ordering::SeqCst);
            holders.fetch_sub(1, Ordering::SeqCst);
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(counter.load(Ordering::SeqCst), ACQUIRERS);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn different_keys_proceed_independently() {
    let locks = KeyedLock::<&'static str>::new();
    let _first = locks.acquire("book-1").await;

    let second = locks.try_acquire("book-2");
    let same = locks.try_acquire("book-1");

    assert!(second.is_some());
    assert!(same.is_none());
    assert_eq!(locks.active_keys(), 2);
}

#[rstest]
#[tokio::test]
async fn waiters_are_served_in_arrival_order() {
    let locks = KeyedLock::<&'static str>::new();
    let order = Arc::new(Mutex::new(Vec::new()));
    let holder = locks.acquire("key").await;

    let mut handles = Vec::new();
    for index in 0..5 {
        let locks = locks.clone();
        let order = Arc::clone(&order);
        handles.push(tokio::spawn(async move {
            let _guard = locks.acquire("key").await;
            order.lock().push(index);
        }));
        tokio::task::yield_now().await;
    }

    drop(holder);
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

// =============================================================================
// Cancellation
// =============================================================================

#[rstest]
#[tokio::test(start_paused = true)]
async fn timed_out_waits_leave_no_entry() {
    let locks = KeyedLock::<&'static str>::new();
    let holder = locks.acquire("book-42").await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let locks = locks.clone();
        handles.push(tokio::spawn(async move {
            locks
                .acquire_timeout("book-42", Duration::from_millis(50))
                .await
                .map(|_| ())
        }));
    }
    for handle in handles {
        assert_eq!(
            handle.await.unwrap(),
            Err(LockError::TimedOut(Duration::from_millis(50)))
        );
    }

    assert_eq!(locks.active_keys(), 1);
    drop(holder);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn dropped_acquisition_leaves_no_entry() {
    let locks = KeyedLock::<&'static str>::new();
    let holder = locks.acquire("book-42").await;

    let pending = tokio::spawn({
        let locks = locks.clone();
        async move {
            let _guard = locks.acquire("book-42").await;
        }
    });
    tokio::task::yield_now().await;
    pending.abort();
    assert!(pending.await.unwrap_err().is_cancelled());

    drop(holder);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn cancellation_signal_aborts_the_wait() {
    let locks = KeyedLock::<&'static str>::new();
    let holder = locks.acquire("book-42").await;
    let (cancel, cancelled) = tokio::sync::oneshot::channel::<()>();

    let waiter = tokio::spawn({
        let locks = locks.clone();
        async move {
            locks
                .acquire_until("book-42", async {
                    let _ = cancelled.await;
                })
                .await
                .map(|_| ())
        }
    });
    tokio::task::yield_now().await;
    cancel.send(()).unwrap();

    assert_eq!(waiter.await.unwrap(), Err(LockError::Cancelled));
    drop(holder);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn waiter_proceeds_after_cancelled_neighbour() {
    let locks = KeyedLock::<&'static str>::new();
    let holder = locks.acquire("key").await;

    let cancelled = tokio::spawn({
        let locks = locks.clone();
        async move { locks.acquire_timeout("key", Duration::from_millis(1)).await.is_ok() }
    });
    let patient = tokio::spawn({
        let locks = locks.clone();
        async move { locks.acquire("key").await.key().to_string() }
    });

    assert!(!cancelled.await.unwrap());
    drop(holder);

    assert_eq!(patient.await.unwrap(), "key");
    assert_eq!(locks.active_keys(), 0);
}

// =============================================================================
// Mutex Pool
// =============================================================================

#[rstest]
#[case(0, 0)]
#[case(1, 1)]
#[case(8, 3)]
#[tokio::test]
async fn pool_never_exceeds_capacity(#[case] capacity: usize, #[case] expected: usize) {
    let locks = KeyedLock::<u32>::with_pool_capacity(capacity);

    let guards = vec![
        locks.acquire(1).await,
        locks.acquire(2).await,
        locks.acquire(3).await,
    ];
    drop(guards);

    assert_eq!(locks.pooled(), expected);
    assert_eq!(locks.active_keys(), 0);
}

#[rstest]
#[tokio::test]
async fn pooled_mutex_is_reused_for_new_key() {
    let locks = KeyedLock::<u32>::with_pool_capacity(4);
    drop(locks.acquire(1).await);
    assert_eq!(locks.pooled(), 1);

    let guard = locks.acquire(2).await;
    assert_eq!(locks.pooled(), 0);
    assert_eq!(*guard.key(), 2);
}
