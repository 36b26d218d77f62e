//! Deduplicating, delaying, rate-limited work queue.
//!
//! Keys move through three collections guarded by one mutex:
//!
//! - `queue`: keys waiting for a worker, in insertion order, no duplicates.
//! - `dirty`: keys that need a worker eventually. Everything in `queue` is
//!   dirty; a key that is re-added while a worker holds it is dirty but not
//!   queued, and goes back on the queue when the worker calls [`WorkQueue::done`].
//! - `processing`: keys checked out by [`WorkQueue::get`] and not yet done.
//!
//! A key is never in `queue` twice and never handed to two workers at once.
//! Delayed adds sit in a min-heap until their deadline and then take the same
//! path as [`WorkQueue::add`].

pub mod rate_limiter;

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::{Counter, Histogram, UpDownCounter};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::telemetry::metrics;
use rate_limiter::{RateLimiter, default_controller_rate_limiter};

/// Bounds every queue key satisfies.
pub trait QueueKey: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<K: Clone + Eq + Hash + Debug + Send + Sync + 'static> QueueKey for K {}

// ---------------------------------------------------------------------------
// Delayed entries
// ---------------------------------------------------------------------------

struct Delayed<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Delayed<K> {
    // Reversed: BinaryHeap is a max-heap, we want the earliest deadline on top.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,

    /// Heap entries are invalidated lazily: an entry is live only while
    /// `ready_at[key]` still equals its deadline.
    delayed: BinaryHeap<Delayed<K>>,
    ready_at: HashMap<K, Instant>,
    seq: u64,

    queued_at: HashMap<K, Instant>,
    started_at: HashMap<K, Instant>,

    shutting_down: bool,
}

impl<K: QueueKey> State<K> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            delayed: BinaryHeap::new(),
            ready_at: HashMap::new(),
            seq: 0,
            queued_at: HashMap::new(),
            started_at: HashMap::new(),
            shutting_down: false,
        }
    }

    /// Mark `key` dirty and queue it unless a worker holds it.
    /// Returns whether the key was appended to `queue`.
    fn insert(&mut self, key: K, metrics: &QueueMetrics) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        metrics.adds.add(1, &metrics.labels);
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.push(key, metrics);
        true
    }

    fn push(&mut self, key: K, metrics: &QueueMetrics) {
        metrics.depth.add(1, &metrics.labels);
        self.queued_at.entry(key.clone()).or_insert_with(Instant::now);
        self.queue.push_back(key);
    }

    /// Schedule `key` for `ready_at`, keeping the earlier deadline if one is
    /// already pending. Returns whether the schedule changed.
    fn insert_delayed(&mut self, key: K, ready_at: Instant) -> bool {
        if let Some(&existing) = self.ready_at.get(&key) {
            if existing <= ready_at {
                return false;
            }
        }
        self.ready_at.insert(key.clone(), ready_at);
        self.seq += 1;
        self.delayed.push(Delayed {
            ready_at,
            seq: self.seq,
            key,
        });
        true
    }

    /// Move every delayed key whose deadline has passed into the queue.
    fn promote_ready(&mut self, now: Instant, metrics: &QueueMetrics) {
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                break;
            }
            let Some(entry) = self.delayed.pop() else {
                break;
            };
            if self.ready_at.get(&entry.key) != Some(&entry.ready_at) {
                continue;
            }
            self.ready_at.remove(&entry.key);
            trace!(key = ?entry.key, "delayed key is ready");
            self.insert(entry.key, metrics);
        }
    }

    /// Earliest live deadline. Drops stale heap entries on the way.
    fn next_ready_at(&mut self) -> Option<Instant> {
        while let Some(entry) = self.delayed.peek() {
            if self.ready_at.get(&entry.key) == Some(&entry.ready_at) {
                return Some(entry.ready_at);
            }
            self.delayed.pop();
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

struct QueueMetrics {
    labels: [KeyValue; 1],
    adds: Counter<u64>,
    depth: UpDownCounter<i64>,
    retries: Counter<u64>,
    latency_ms: Histogram<f64>,
    work_duration_ms: Histogram<f64>,
}

impl QueueMetrics {
    fn new(name: &str) -> Self {
        Self {
            labels: [KeyValue::new("queue", name.to_string())],
            adds: metrics::queue_adds(),
            depth: metrics::queue_depth(),
            retries: metrics::queue_retries(),
            latency_ms: metrics::queue_latency_ms(),
            work_duration_ms: metrics::work_duration_ms(),
        }
    }
}

fn millis(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Roughly 30 years; stands in for deadlines that overflow `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

// ---------------------------------------------------------------------------
// WorkQueue
// ---------------------------------------------------------------------------

/// In-process work queue with dedup, delayed adds and rate-limited retries.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter<K>>,
    metrics: QueueMetrics,
}

impl<K: QueueKey> WorkQueue<K> {
    /// Create a queue backed by [`default_controller_rate_limiter`].
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_rate_limiter(name, Box::new(default_controller_rate_limiter()))
    }

    pub fn with_rate_limiter(
        name: impl Into<String>,
        rate_limiter: Box<dyn RateLimiter<K>>,
    ) -> Self {
        let name = name.into();
        Self {
            metrics: QueueMetrics::new(&name),
            name,
            state: Mutex::new(State::new()),
            notify: Notify::new(),
            rate_limiter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue `key` for processing.
    ///
    /// No-op if the key is already waiting. If a worker currently holds the
    /// key it is marked dirty and re-queued when that worker calls
    /// [`done`](Self::done). Ignored once the queue is shutting down.
    pub fn add(&self, key: K) {
        let queued = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert(key, &self.metrics)
        };
        if queued {
            self.notify.notify_one();
        }
    }

    /// Queue `key` once `delay` has elapsed.
    ///
    /// Multiple delayed adds of one key coalesce; the earliest deadline wins.
    /// A zero delay is an immediate [`add`](Self::add).
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key);
        }
        let ready_at = deadline_after(delay);
        let rescheduled = {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.insert_delayed(key, ready_at)
        };
        // Idle workers sleep until the old earliest deadline; wake one to
        // pick up the new one.
        if rescheduled {
            self.notify.notify_one();
        }
    }

    /// Queue `key` after the delay the rate limiter assigns it, counting a
    /// requeue.
    pub fn add_rate_limited(&self, key: K) {
        if self.shutting_down() {
            return;
        }
        let delay = self.rate_limiter.when(&key);
        self.metrics.retries.add(1, &self.metrics.labels);
        debug!(queue = %self.name, key = ?key, delay = ?delay, "requeue");
        self.add_after(key, delay);
    }

    /// Wait for the next key.
    ///
    /// The key is checked out until [`done`](Self::done) is called with it.
    /// Returns `None` once the queue is shutting down and nothing is left to
    /// hand out; callers should treat that as a signal to exit.
    pub async fn get(&self) -> Option<K> {
        loop {
            let mut notified = pin!(self.notify.notified());
            // Register before inspecting state so a wakeup between the check
            // and the await is not lost.
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                state.promote_ready(Instant::now(), &self.metrics);

                if let Some(key) = state.queue.pop_front() {
                    self.metrics.depth.add(-1, &self.metrics.labels);
                    if let Some(queued_at) = state.queued_at.remove(&key) {
                        self.metrics
                            .latency_ms
                            .record(millis(queued_at), &self.metrics.labels);
                    }
                    state.started_at.insert(key.clone(), Instant::now());
                    state.processing.insert(key.clone());
                    state.dirty.remove(&key);

                    let more = !state.queue.is_empty();
                    drop(state);
                    // Promotion can queue several keys at once; pass the
                    // baton so other idle workers see them.
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                if state.shutting_down {
                    return None;
                }
                state.next_ready_at()
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after processing.
    ///
    /// If the key was added again while it was checked out, it goes straight
    /// back on the queue.
    pub fn done(&self, key: &K) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if let Some(started_at) = state.started_at.remove(key) {
                self.metrics
                    .work_duration_ms
                    .record(millis(started_at), &self.metrics.labels);
            }
            if state.dirty.contains(key) {
                state.push(key.clone(), &self.metrics);
                true
            } else {
                false
            }
        };
        if requeued {
            self.notify.notify_one();
        }
    }

    /// Reset the requeue counter of `key`. Queue membership is unaffected.
    pub fn forget(&self, key: &K) {
        self.rate_limiter.forget(key);
    }

    /// Rate-limited requeues of `key` since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.rate_limiter.num_requeues(key)
    }

    /// Keys waiting for a worker, including delayed keys that are now due.
    pub fn len(&self) -> usize {
        let mut state = self.lock();
        state.promote_ready(Instant::now(), &self.metrics);
        state.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// No key bounds: callable from `Drop` impls.
impl<K> WorkQueue<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stop accepting keys and wake every waiting worker.
    ///
    /// Keys already queued are still handed out; delayed keys that have not
    /// fired are discarded. Idempotent.
    pub fn shut_down(&self) {
        {
            let mut state = self.lock();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.delayed.clear();
            state.ready_at.clear();
        }
        debug!(queue = %self.name, "queue shutting down");
        self.notify.notify_waiters();
    }

    pub fn shutting_down(&self) -> bool {
        self.lock().shutting_down
    }
}

impl<K> Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
