//! # syncqueue
//!
//! Work queue for level-triggered controllers.
//!
//! Change notifications are reduced to keys, deduplicated, and handed to a
//! pool of workers so that no key is ever synced by two workers at once.
//! Failed syncs are retried with backoff up to a bounded budget, and shutdown
//! waits for in-flight syncs to finish.

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod queue;
pub mod telemetry;

pub use controller::{SyncQueue, SyncQueueBuilder};
pub use model::{Object, ObjectKey};
pub use queue::WorkQueue;
