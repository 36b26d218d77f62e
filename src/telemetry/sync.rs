//! Sync span helpers.
//!
//! Provides span creation and result recording for handler invocations
//! driven by a sync queue.

use std::fmt::Debug;

use tracing::Span;

/// Start a span for one handler invocation.
///
/// The `sync.result` field is declared empty and is filled in by
/// [`record_sync_result`].
pub fn start_sync_span(queue: &str, key: &dyn Debug) -> Span {
    tracing::info_span!(
        "sync.handle",
        "sync.queue" = queue,
        "sync.key" = ?key,
        "sync.result" = tracing::field::Empty,
    )
}

/// Record how a handler invocation ended.
pub fn record_sync_result(span: &Span, result: &str) {
    span.record("sync.result", result);
}
