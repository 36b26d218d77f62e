//! Controller plumbing: key functions, the sync queue, and its workers.

pub mod sync_queue;
mod worker;

use std::sync::Arc;

use crate::error::Result;
use crate::model::{ObjectKey, ToObjectKey};

pub use sync_queue::{DEFAULT_MAX_RETRIES, SyncQueue, SyncQueueBuilder};

/// Derives the queue key of a notified object.
///
/// Failures are not transient: the notification is reported and dropped.
pub type KeyFn<T, K> = Arc<dyn Fn(&T) -> Result<K> + Send + Sync>;

/// `namespace/name` key, honouring deletion tombstones.
pub fn default_key_fn<T: ToObjectKey + 'static>() -> KeyFn<T, ObjectKey> {
    Arc::new(|obj: &T| obj.to_object_key())
}

/// The notified object is its own key.
pub fn passthrough_key_fn<T: Clone + 'static>() -> KeyFn<T, T> {
    Arc::new(|obj: &T| Ok(obj.clone()))
}
