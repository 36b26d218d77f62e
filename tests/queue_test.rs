//! Integration tests for the work queue.

use std::sync::Arc;
use std::time::Duration;

use syncqueue::queue::WorkQueue;
use syncqueue::queue::rate_limiter::{ExponentialFailureRateLimiter, FastSlowRateLimiter};
use tokio::time::{Instant, timeout};

const SHORT: Duration = Duration::from_millis(50);
const LONG: Duration = Duration::from_secs(2);

fn test_queue() -> WorkQueue<&'static str> {
    WorkQueue::with_rate_limiter(
        "test",
        Box::new(ExponentialFailureRateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        )),
    )
}

async fn get_now<K: syncqueue::queue::QueueKey>(queue: &WorkQueue<K>) -> Option<K> {
    timeout(SHORT, queue.get()).await.ok().flatten()
}

// ---------------------------------------------------------------------------
// Dedup and ordering
// ---------------------------------------------------------------------------

#[tokio::test]
async fn repeated_adds_dispatch_once() {
    let queue = test_queue();
    queue.add("a");
    queue.add("a");
    queue.add("a");
    assert_eq!(queue.len(), 1);

    assert_eq!(get_now(&queue).await, Some("a"));
    assert_eq!(queue.len(), 0);
    assert_eq!(get_now(&queue).await, None);
}

#[tokio::test]
async fn keys_come_out_in_insertion_order() {
    let queue = test_queue();
    for key in ["c", "a", "b", "a"] {
        queue.add(key);
    }

    let mut order = Vec::new();
    while let Some(key) = get_now(&queue).await {
        order.push(key);
        queue.done(&key);
    }
    assert_eq!(order, vec!["c", "a", "b"]);
}

// ---------------------------------------------------------------------------
// Processing and dirty keys
// ---------------------------------------------------------------------------

#[tokio::test]
async fn key_is_not_handed_out_twice_while_processing() {
    let queue = test_queue();
    queue.add("a");
    assert_eq!(get_now(&queue).await, Some("a"));

    queue.add("a");
    assert_eq!(queue.len(), 0, "processing key must not be queued");
    assert_eq!(get_now(&queue).await, None);
}

#[tokio::test]
async fn add_during_processing_redispatches_after_done() {
    let queue = test_queue();
    queue.add("a");
    let key = get_now(&queue).await.unwrap();

    queue.add("a");
    queue.add("a");
    queue.done(&key);

    assert_eq!(get_now(&queue).await, Some("a"));
    queue.done(&"a");
    assert_eq!(get_now(&queue).await, None, "exactly one extra dispatch");
}

#[tokio::test]
async fn done_without_readd_drops_key() {
    let queue = test_queue();
    queue.add("a");
    let key = get_now(&queue).await.unwrap();
    queue.done(&key);

    assert!(queue.is_empty());
    assert_eq!(get_now(&queue).await, None);
}

#[tokio::test]
async fn blocked_get_wakes_on_add() {
    let queue = Arc::new(test_queue());
    let getter = {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move { queue.get().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    queue.add("late");

    let got = timeout(LONG, getter).await.unwrap().unwrap();
    assert_eq!(got, Some("late"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_getters_split_distinct_keys() {
    let queue = Arc::new(WorkQueue::<u32>::new("split"));
    let mut getters = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        getters.push(tokio::spawn(async move { queue.get().await }));
    }

    for key in 0..4 {
        queue.add(key);
    }

    let mut got = Vec::new();
    for getter in getters {
        got.push(timeout(LONG, getter).await.unwrap().unwrap().unwrap());
    }
    got.sort();
    assert_eq!(got, vec![0, 1, 2, 3]);
}

// ---------------------------------------------------------------------------
// Delayed adds
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_after_waits_for_delay() {
    let queue = test_queue();
    let start = Instant::now();
    queue.add_after("a", Duration::from_millis(30));
    assert_eq!(queue.len(), 0);

    let key = timeout(LONG, queue.get()).await.unwrap();
    assert_eq!(key, Some("a"));
    assert!(start.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn add_after_zero_is_immediate() {
    let queue = test_queue();
    queue.add_after("a", Duration::ZERO);
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn earliest_delay_wins_and_fires_once() {
    let queue = test_queue();
    let start = Instant::now();
    queue.add_after("a", Duration::from_millis(300));
    queue.add_after("a", Duration::from_millis(20));
    queue.add_after("a", Duration::from_millis(200));

    let key = timeout(LONG, queue.get()).await.unwrap().unwrap();
    assert!(start.elapsed() < Duration::from_millis(200));
    queue.done(&key);

    // The superseded deadlines must not fire again.
    tokio::time::sleep(Duration::from_millis(350)).await;
    assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn unbounded_delay_parks_key_without_blocking_others() {
    let queue = test_queue();
    queue.add_after("never", Duration::MAX);
    queue.add_after("never", Duration::from_secs(u64::MAX));
    assert_eq!(queue.len(), 0);

    queue.add("b");
    assert_eq!(get_now(&queue).await, Some("b"));
    assert_eq!(get_now(&queue).await, None);

    queue.shut_down();
    assert_eq!(timeout(LONG, queue.get()).await.unwrap(), None);
}

#[tokio::test]
async fn delayed_key_coalesces_with_queued_key() {
    let queue = test_queue();
    queue.add("a");
    queue.add_after("a", Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(queue.len(), 1);
    assert_eq!(get_now(&queue).await, Some("a"));
}

#[tokio::test]
async fn delayed_key_marks_processing_key_dirty() {
    let queue = test_queue();
    queue.add("a");
    let key = get_now(&queue).await.unwrap();

    queue.add_after("a", Duration::from_millis(10));
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(queue.len(), 0);

    queue.done(&key);
    assert_eq!(get_now(&queue).await, Some("a"));
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_rate_limited_counts_requeues() {
    let queue = test_queue();
    assert_eq!(queue.num_requeues(&"a"), 0);

    queue.add_rate_limited("a");
    queue.add_rate_limited("a");
    assert_eq!(queue.num_requeues(&"a"), 2);
    assert_eq!(queue.num_requeues(&"b"), 0);

    let key = timeout(LONG, queue.get()).await.unwrap();
    assert_eq!(key, Some("a"));

    queue.forget(&"a");
    assert_eq!(queue.num_requeues(&"a"), 0);
}

#[tokio::test]
async fn forget_does_not_touch_membership() {
    let queue = test_queue();
    queue.add("a");
    queue.forget(&"a");
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn rate_limited_delay_comes_from_policy() {
    let queue: WorkQueue<&str> = WorkQueue::with_rate_limiter(
        "fast-slow",
        Box::new(FastSlowRateLimiter::new(
            Duration::ZERO,
            Duration::from_secs(60),
            1,
        )),
    );

    // First requeue is fast (zero delay means an immediate add).
    queue.add_rate_limited("a");
    assert_eq!(queue.len(), 1);
    let key = get_now(&queue).await.unwrap();
    queue.done(&key);

    // Second requeue is slow.
    queue.add_rate_limited("a");
    assert_eq!(get_now(&queue).await, None);
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shut_down_releases_blocked_getters() {
    let queue = Arc::new(test_queue());
    let mut getters = Vec::new();
    for _ in 0..3 {
        let queue = Arc::clone(&queue);
        getters.push(tokio::spawn(async move { queue.get().await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.shut_down();
    for getter in getters {
        assert_eq!(timeout(LONG, getter).await.unwrap().unwrap(), None);
    }
    assert!(queue.shutting_down());
}

#[tokio::test]
async fn shut_down_drains_queued_keys_then_stops() {
    let queue = test_queue();
    queue.add("a");
    queue.add("b");
    queue.shut_down();

    assert_eq!(get_now(&queue).await, Some("a"));
    assert_eq!(get_now(&queue).await, Some("b"));
    assert_eq!(timeout(LONG, queue.get()).await.unwrap(), None);
}

#[tokio::test]
async fn adds_are_ignored_after_shut_down() {
    let queue = test_queue();
    queue.shut_down();
    queue.shut_down();

    queue.add("a");
    queue.add_after("b", Duration::from_millis(1));
    queue.add_rate_limited("c");

    assert_eq!(queue.len(), 0);
    assert_eq!(queue.num_requeues(&"c"), 0);
    assert_eq!(timeout(LONG, queue.get()).await.unwrap(), None);
}

#[tokio::test]
async fn pending_delays_are_discarded_on_shut_down() {
    let queue = test_queue();
    queue.add_after("a", Duration::from_millis(30));
    queue.shut_down();

    let start = Instant::now();
    assert_eq!(timeout(LONG, queue.get()).await.unwrap(), None);
    assert!(start.elapsed() < Duration::from_millis(30));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn dirty_key_is_drained_after_shut_down() {
    let queue = test_queue();
    queue.add("a");
    let key = get_now(&queue).await.unwrap();
    queue.add("a");
    queue.shut_down();

    queue.done(&key);
    assert_eq!(get_now(&queue).await, Some("a"));
    queue.done(&"a");
    assert_eq!(timeout(LONG, queue.get()).await.unwrap(), None);
}
