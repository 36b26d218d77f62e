//! Metric instrument factories for syncqueue.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! All instruments are created from the `"syncqueue"` meter; with no provider
//! installed they are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};

/// Returns the shared meter for syncqueue instruments.
fn meter() -> Meter {
    opentelemetry::global::meter("syncqueue")
}

/// Counter: keys accepted by a queue (deduplicated adds are not counted).
/// Labels: `queue`.
pub fn queue_adds() -> Counter<u64> {
    meter()
        .u64_counter("syncqueue.queue.adds")
        .with_description("Number of keys added to the queue")
        .build()
}

/// Up/down counter: keys waiting for a worker.
/// Labels: `queue`.
pub fn queue_depth() -> UpDownCounter<i64> {
    meter()
        .i64_up_down_counter("syncqueue.queue.depth")
        .with_description("Keys waiting for a worker")
        .build()
}

/// Counter: rate-limited re-adds.
/// Labels: `queue`.
pub fn queue_retries() -> Counter<u64> {
    meter()
        .u64_counter("syncqueue.queue.retries")
        .with_description("Number of rate-limited re-adds")
        .build()
}

/// Histogram: time a key waited in the queue before a worker picked it up.
/// Labels: `queue`.
pub fn queue_latency_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncqueue.queue.latency_ms")
        .with_description("Time between add and get")
        .with_unit("ms")
        .build()
}

/// Histogram: time a key was checked out by a worker.
/// Labels: `queue`.
pub fn work_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("syncqueue.queue.work_duration_ms")
        .with_description("Time between get and done")
        .with_unit("ms")
        .build()
}

/// Counter: handler results.
/// Labels: `queue`, `result` ("success" | "retry" | "dropped").
pub fn sync_results() -> Counter<u64> {
    meter()
        .u64_counter("syncqueue.sync.results")
        .with_description("Sync handler results")
        .build()
}

/// Counter: notifications dropped because no key could be derived.
/// Labels: `queue`.
pub fn key_errors() -> Counter<u64> {
    meter()
        .u64_counter("syncqueue.sync.key_errors")
        .with_description("Notifications dropped on key derivation failure")
        .build()
}
