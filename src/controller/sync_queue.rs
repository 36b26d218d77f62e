//! Sync queue: a work queue bound to a key function and a handler, drained
//! by a fixed pool of workers with bounded retry.
//!
//! Notifications go in through [`SyncQueue::enqueue`] and friends, are
//! reduced to keys, and each key is handed to the handler by exactly one
//! worker at a time. A failed sync is retried with backoff up to
//! `max_retries` times, then dropped and forgotten so a later notification
//! starts with a fresh budget.

use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::worker::{Handler, Worker, boxed_handler};
use super::{KeyFn, default_key_fn, passthrough_key_fn};
use crate::model::{ObjectKey, ToObjectKey};
use crate::queue::rate_limiter::RateLimiter;
use crate::queue::{QueueKey, WorkQueue};
use crate::telemetry::metrics;

/// Retries of a failing key before it is dropped.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Controller helper: reduces notifications to keys and syncs each key.
pub struct SyncQueue<T, K = ObjectKey> {
    queue: Arc<WorkQueue<K>>,
    handler: Handler<K>,
    key_fn: KeyFn<T, K>,
    max_retries: u32,
    sync_type: &'static str,
    workers: TaskTracker,
    shutdown: CancellationToken,
    key_errors: Counter<u64>,
}

impl<T: ToObjectKey + 'static> SyncQueue<T, ObjectKey> {
    /// Sync queue keyed by `namespace/name`.
    pub fn new<F, Fut, E>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        SyncQueueBuilder::new(name, default_key_fn(), handler).build()
    }
}

impl<T: QueueKey> SyncQueue<T, T> {
    /// Sync queue that uses the notified object itself as the key.
    pub fn passthrough<F, Fut, E>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        SyncQueueBuilder::new(name, passthrough_key_fn(), handler).build()
    }
}

impl<T: 'static, K: QueueKey> SyncQueue<T, K> {
    /// Sync queue with a custom key function.
    pub fn with_key_fn<F, Fut, E>(
        name: impl Into<String>,
        key_fn: KeyFn<T, K>,
        handler: F,
    ) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        SyncQueueBuilder::new(name, key_fn, handler).build()
    }

    /// Builder for a sync queue with a custom rate limiter or retry budget.
    pub fn builder<F, Fut, E>(
        name: impl Into<String>,
        key_fn: KeyFn<T, K>,
        handler: F,
    ) -> SyncQueueBuilder<T, K>
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        SyncQueueBuilder::new(name, key_fn, handler)
    }

    /// Change the retry budget. Zero is ignored. Takes effect for workers
    /// started by later calls to [`run`](Self::run).
    pub fn set_max_retries(&mut self, max_retries: u32) {
        if max_retries > 0 {
            self.max_retries = max_retries;
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// The underlying work queue.
    pub fn queue(&self) -> &Arc<WorkQueue<K>> {
        &self.queue
    }

    /// Type name of the notified objects, as used in log fields.
    pub fn sync_type(&self) -> &'static str {
        self.sync_type
    }

    /// Queue the key of `obj`.
    pub fn enqueue(&self, obj: &T) {
        if let Some(key) = self.key_of(obj) {
            self.queue.add(key);
        }
    }

    /// Queue the key of `obj` once the rate limiter allows it.
    pub fn enqueue_rate_limited(&self, obj: &T) {
        if let Some(key) = self.key_of(obj) {
            self.queue.add_rate_limited(key);
        }
    }

    /// Queue the key of `obj` after `delay`.
    pub fn enqueue_after(&self, obj: &T, delay: Duration) {
        if let Some(key) = self.key_of(obj) {
            self.queue.add_after(key, delay);
        }
    }

    fn key_of(&self, obj: &T) -> Option<K> {
        if self.queue.shutting_down() {
            return None;
        }
        match (self.key_fn)(obj) {
            Ok(key) => Some(key),
            Err(err) => {
                self.key_errors
                    .add(1, &[KeyValue::new("queue", self.queue.name().to_string())]);
                error!(
                    queue = %self.queue.name(),
                    sync_type = self.sync_type,
                    error = %err,
                    "dropping notification"
                );
                None
            }
        }
    }

    /// Start `workers` worker tasks on the current tokio runtime.
    ///
    /// Workers run until the queue is shut down and drained. Cancelling
    /// `stop` shuts the queue down; use [`shut_down`](Self::shut_down) to
    /// wait for the workers to finish.
    pub fn run(&self, workers: usize, stop: CancellationToken) {
        info!(
            queue = %self.queue.name(),
            workers,
            max_retries = self.max_retries,
            "starting workers"
        );
        for id in 0..workers {
            let worker = Worker {
                queue: Arc::clone(&self.queue),
                handler: Arc::clone(&self.handler),
                max_retries: self.max_retries,
                sync_type: self.sync_type,
                results: metrics::sync_results(),
            };
            self.workers.spawn(worker.run(id));
        }

        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {
                    debug!(queue = %queue.name(), "stop signal received");
                    queue.shut_down();
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }

    /// Shut the queue down and wait until every worker has finished its
    /// current key and exited. Safe to call more than once.
    pub async fn shut_down(&self) {
        self.queue.shut_down();
        self.shutdown.cancel();
        self.workers.close();
        self.workers.wait().await;
        debug!(queue = %self.queue.name(), "workers stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.queue.shutting_down()
    }
}

impl<T, K> Drop for SyncQueue<T, K> {
    fn drop(&mut self) {
        // Without a handle nothing can join the workers; let them drain and
        // exit, and release the stop-signal watcher spawned by `run`.
        self.queue.shut_down();
        self.shutdown.cancel();
    }
}

/// Builder for a [`SyncQueue`] with a custom rate limiter or retry budget.
pub struct SyncQueueBuilder<T, K> {
    name: String,
    key_fn: KeyFn<T, K>,
    handler: Handler<K>,
    rate_limiter: Option<Box<dyn RateLimiter<K>>>,
    max_retries: u32,
}

impl<T: 'static, K: QueueKey> SyncQueueBuilder<T, K> {
    pub fn new<F, Fut, E>(name: impl Into<String>, key_fn: KeyFn<T, K>, handler: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        Self {
            name: name.into(),
            key_fn,
            handler: boxed_handler(handler),
            rate_limiter: None,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn rate_limiter(mut self, rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        self.rate_limiter = Some(Box::new(rate_limiter));
        self
    }

    /// Zero is ignored.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        if max_retries > 0 {
            self.max_retries = max_retries;
        }
        self
    }

    pub fn build(self) -> SyncQueue<T, K> {
        let queue = match self.rate_limiter {
            Some(rate_limiter) => WorkQueue::with_rate_limiter(self.name, rate_limiter),
            None => WorkQueue::new(self.name),
        };
        SyncQueue {
            queue: Arc::new(queue),
            handler: self.handler,
            key_fn: self.key_fn,
            max_retries: self.max_retries,
            sync_type: std::any::type_name::<T>(),
            workers: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            key_errors: metrics::key_errors(),
        }
    }
}
