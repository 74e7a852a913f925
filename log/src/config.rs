//! Configuration options for a log instance.
//!
//! All durations are millisecond-valued so the struct round-trips cleanly
//! through YAML/JSON config files. Values are converted to microseconds
//! internally, which is the unit every timestamp in the log uses.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for opening a [`Log`](crate::Log).
///
/// # Example
///
/// ```ignore
/// let config = LogConfig {
///     num_buckets: 4,
///     send_batch_size: 64,
///     ..LogConfig::default()
/// };
/// let log = manager.open_log("tx-log", marker, config).await?;
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Deadline in ms for persisting messages against the backend.
    pub max_write_time_ms: u64,

    /// Deadline in ms for reading messages from the backend.
    pub max_read_time_ms: u64,

    /// How far polls hold back from "now", in ms. The send delay is added
    /// on top internally so readers never race writers that are still
    /// batching.
    pub read_lag_time_ms: u64,

    /// Whether to use key-consistent transactions for log operations.
    pub key_consistent: bool,

    /// Number of buckets each timeslice is subdivided into. More buckets
    /// spread reads and writes across more row keys.
    pub num_buckets: u32,

    /// Maximum number of messages written per flush. Also sizes the
    /// outgoing queue (ten times this value).
    pub send_batch_size: usize,

    /// Target maximum age in ms of the oldest queued message before a
    /// flush. Values below 10 ms disable batching entirely: every produce
    /// flushes inline.
    pub send_delay_ms: u64,

    /// Concurrency bound for reader callbacks.
    pub read_threads: usize,

    /// Maximum number of messages fetched per poll slice.
    pub read_batch_size: usize,

    /// Fixed delay in ms between polls of one (partition, bucket).
    pub read_interval_ms: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_write_time_ms: 10_000,
            max_read_time_ms: 4_000,
            read_lag_time_ms: 500,
            key_consistent: false,
            num_buckets: 1,
            send_batch_size: 256,
            send_delay_ms: 1_000,
            read_threads: 1,
            read_batch_size: 1_024,
            read_interval_ms: 5_000,
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_buckets < 1 {
            return Err(Error::InvalidArgument(
                "num_buckets must be at least 1".into(),
            ));
        }
        if self.send_batch_size < 1 {
            return Err(Error::InvalidArgument(
                "send_batch_size must be at least 1".into(),
            ));
        }
        if self.read_batch_size < 1 {
            return Err(Error::InvalidArgument(
                "read_batch_size must be at least 1".into(),
            ));
        }
        if self.read_threads < 1 {
            return Err(Error::InvalidArgument(
                "read_threads must be at least 1".into(),
            ));
        }
        if self.max_write_time_ms == 0 || self.max_read_time_ms == 0 {
            return Err(Error::InvalidArgument(
                "backend deadlines must be positive".into(),
            ));
        }
        if self.read_interval_ms == 0 {
            return Err(Error::InvalidArgument(
                "read_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
