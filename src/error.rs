//! Error types for syncqueue.
//!
//! Queue operations never fail; these cover the edges around them: key
//! derivation, configuration, and telemetry setup. Handler failures are
//! `anyhow::Error` and never leave the worker loop.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("couldn't get key for {sync_type}: {reason}")]
    Key {
        sync_type: &'static str,
        reason: String,
    },

    #[error("invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: &'static str },

    #[error("config error: {0}")]
    Config(String),

    #[error("telemetry error: {0}")]
    Telemetry(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Key-derivation failure for a notification of type `T`.
    pub fn key<T: ?Sized>(reason: impl Into<String>) -> Self {
        Error::Key {
            sync_type: std::any::type_name::<T>(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
