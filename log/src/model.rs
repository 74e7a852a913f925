//! Core data types for the log API.

use async_trait::async_trait;
use bytes::Bytes;
use tidelog_common::Clock;

/// A message consumed from the log.
///
/// The payload is the exact byte sequence that was produced; the log never
/// interprets it. The timestamp is the producer-side microsecond wall clock
/// at produce time, and `sender_id` identifies the producing process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub payload: Bytes,
    pub timestamp_micros: i64,
    pub sender_id: String,
}

/// Where a consumer starts reading and, optionally, under which identity
/// its progress is persisted.
///
/// Markers without an identifier are ephemeral: pullers start at
/// `start_time_micros` on every open and never write cursors. Markers with
/// an identifier resume from the persisted cursor when one exists and fall
/// back to `start_time_micros` otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadMarker {
    identifier: Option<String>,
    start_time_micros: i64,
}

impl ReadMarker {
    /// An ephemeral marker starting at the given microsecond timestamp.
    pub fn from_time(start_time_micros: i64) -> Self {
        Self {
            identifier: None,
            start_time_micros,
        }
    }

    /// An ephemeral marker starting at the clock's current time.
    pub fn from_now(clock: &dyn Clock) -> Self {
        Self::from_time(clock.micros())
    }

    /// A persistent marker. Cursors are stored per
    /// (identifier, partition, bucket) and survive restarts.
    pub fn with_identifier(identifier: impl Into<String>, start_time_micros: i64) -> Self {
        Self {
            identifier: Some(identifier.into()),
            start_time_micros,
        }
    }

    pub fn has_identifier(&self) -> bool {
        self.identifier.is_some()
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn start_time_micros(&self) -> i64 {
        self.start_time_micros
    }
}

/// A consumer callback registered with [`Log::register_readers`].
///
/// Delivery is at-least-once and callbacks for different messages may run
/// concurrently (bounded by the configured `read_threads`). A failing
/// reader is logged and does not affect other readers or the puller.
///
/// [`Log::register_readers`]: crate::Log::register_readers
#[async_trait]
pub trait MessageReader: Send + Sync {
    async fn process(
        &self,
        message: Message,
    ) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>;
}
