//! Error types for log operations.

use std::sync::Arc;

use thiserror::Error;
use tidelog_common::StorageError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The log no longer accepts produces or registrations.
    #[error("log `{0}` has been closed")]
    Closed(String),

    /// A caller-supplied value was rejected. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A backend operation kept failing until its deadline ran out.
    /// The last underlying failure is attached as the cause.
    #[error("backend operation `{op}` did not complete within its deadline")]
    BackendUnavailable {
        op: &'static str,
        #[source]
        source: StorageError,
    },

    /// A non-retryable storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A stored buffer did not match the expected wire layout.
    #[error("encoding error: {0}")]
    Encoding(String),

    /// The flush carrying this message failed; the cause is shared by
    /// every message of the batch.
    #[error("message delivery failed: {0}")]
    DeliveryFailed(Arc<Error>),

    /// The log shut down before the message was flushed.
    #[error("log was closed before the message could be flushed")]
    DeliveryAbandoned,
}
