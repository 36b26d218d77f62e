//! Worker loop: get a key, run the handler, settle the key.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use opentelemetry::KeyValue;
use opentelemetry::metrics::Counter;
use tracing::{Instrument, Span, debug, error, warn};

use crate::queue::{QueueKey, WorkQueue};
use crate::telemetry::sync::{record_sync_result, start_sync_span};

/// Type-erased sync handler.
pub(crate) type Handler<K> =
    Arc<dyn Fn(K) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub(crate) fn boxed_handler<K, F, Fut, E>(handler: F) -> Handler<K>
where
    K: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    let handler = Arc::new(handler);
    Arc::new(move |key: K| -> BoxFuture<'static, anyhow::Result<()>> {
        let handler = Arc::clone(&handler);
        // Call inside the future so a panic while building it is caught too.
        async move { handler(key).await.map_err(Into::into) }.boxed()
    })
}

pub(crate) struct Worker<K> {
    pub(crate) queue: Arc<WorkQueue<K>>,
    pub(crate) handler: Handler<K>,
    pub(crate) max_retries: u32,
    pub(crate) sync_type: &'static str,
    pub(crate) results: Counter<u64>,
}

impl<K: QueueKey> Worker<K> {
    /// Process keys until the queue is shut down and drained.
    pub(crate) async fn run(self, id: usize) {
        debug!(queue = %self.queue.name(), worker = id, "worker started");
        while self.process_next_work_item().await {}
        debug!(queue = %self.queue.name(), worker = id, "worker stopped");
    }

    async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let span = start_sync_span(self.queue.name(), &key);
        let result = AssertUnwindSafe((self.handler)(key.clone()))
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|panic| {
                Err(anyhow::anyhow!(
                    "sync handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
            });

        self.handle_sync_result(result, &key, &span);
        // Always release the key, whatever the handler did; this is what
        // re-dispatches a key that was re-added mid-sync.
        self.queue.done(&key);
        true
    }

    fn handle_sync_result(&self, result: anyhow::Result<()>, key: &K, span: &Span) {
        let Err(err) = result else {
            self.queue.forget(key);
            self.record(span, "success");
            return;
        };

        let requeues = self.queue.num_requeues(key);
        if requeues < self.max_retries {
            warn!(
                queue = %self.queue.name(),
                sync_type = self.sync_type,
                key = ?key,
                attempt = requeues + 1,
                error = %format!("{err:#}"),
                "error syncing object, retrying"
            );
            self.queue.add_rate_limited(key.clone());
            self.record(span, "retry");
            return;
        }

        error!(
            queue = %self.queue.name(),
            sync_type = self.sync_type,
            key = ?key,
            attempts = requeues + 1,
            error = %format!("{err:#}"),
            "dropping object out of queue"
        );
        self.queue.forget(key);
        self.record(span, "dropped");
    }

    fn record(&self, span: &Span, result: &'static str) {
        record_sync_result(span, result);
        self.results.add(
            1,
            &[
                KeyValue::new("queue", self.queue.name().to_string()),
                KeyValue::new("result", result),
            ],
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
