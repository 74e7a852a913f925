//! The polling read path.
//!
//! One `MessagePuller` exists per (read-partition, bucket). Each puller
//! owns a microsecond cursor and, on a fixed cadence, range-reads its
//! current timeslice row from the cursor up to `now − read_lag`, capped at
//! the end of the slice so one poll never leaves its row. The lag holds
//! readers back from "live" so they cannot race writers that are still
//! batching. As wall-clock time moves past a slice boundary, the cursor
//! follows and the puller's row key advances with it.
//!
//! Each tick starts by persisting the cursor (when the read marker carries
//! an identifier), so a crash loses at most one poll interval of progress.
//! The cursor itself only advances when a poll completes successfully.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tidelog_common::{Entry, KeySliceQuery};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::backend;
use crate::error::Result;
use crate::log::LogCore;
use crate::model::{Message, MessageReader};
use crate::serde;

/// Delay before a freshly registered reader's pullers start polling.
const INITIAL_READER_DELAY: Duration = Duration::from_millis(100);

/// How many extra microseconds past the last seen timestamp the
/// limit-saturation follow-up query covers. Two instead of one so the
/// follow-up slice cannot come up empty when stragglers share the last
/// microsecond.
const SATURATION_SLACK_MICROS: i64 = 2;

pub(crate) struct MessagePuller {
    core: Arc<LogCore>,
    partition_id: u32,
    bucket_id: u32,
    next_timestamp: Arc<AtomicI64>,
}

/// Close-side handle to a running puller: its cursor and its task.
pub(crate) struct PullerHandle {
    pub partition_id: u32,
    pub bucket_id: u32,
    pub next_timestamp: Arc<AtomicI64>,
    pub task: JoinHandle<()>,
}

impl PullerHandle {
    /// Persists the puller's cursor if the read marker is identified.
    pub(crate) async fn persist_cursor(&self, core: &LogCore) -> Result<()> {
        if let Some(identifier) = core.read_marker.identifier() {
            core.write_setting(
                identifier,
                serde::marker_column(self.partition_id, self.bucket_id),
                self.next_timestamp.load(Ordering::SeqCst),
            )
            .await?;
        }
        Ok(())
    }
}

impl MessagePuller {
    /// Creates a puller with its cursor initialized from the read marker:
    /// the persisted cursor when the marker has an identifier and one was
    /// stored, the marker's start time otherwise.
    pub(crate) async fn new(
        core: Arc<LogCore>,
        partition_id: u32,
        bucket_id: u32,
    ) -> Result<Self> {
        let start = core.read_marker.start_time_micros();
        let cursor = match core.read_marker.identifier() {
            Some(identifier) => {
                core.read_setting(
                    identifier,
                    serde::marker_column(partition_id, bucket_id),
                    start,
                )
                .await?
            }
            None => start,
        };
        Ok(Self {
            core,
            partition_id,
            bucket_id,
            next_timestamp: Arc::new(AtomicI64::new(cursor)),
        })
    }

    /// Initializes the puller and schedules its polling task.
    pub(crate) async fn spawn(
        core: Arc<LogCore>,
        partition_id: u32,
        bucket_id: u32,
    ) -> Result<PullerHandle> {
        let puller = Self::new(core, partition_id, bucket_id).await?;
        let next_timestamp = Arc::clone(&puller.next_timestamp);
        let task = tokio::spawn(puller.run());
        Ok(PullerHandle {
            partition_id,
            bucket_id,
            next_timestamp,
            task,
        })
    }

    async fn run(self) {
        let shutdown = self.core.shutdown.clone();
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(INITIAL_READER_DELAY) => {}
        }
        loop {
            if let Err(err) = self.poll_once().await {
                warn!(
                    log = %self.core.name,
                    partition = self.partition_id,
                    bucket = self.bucket_id,
                    error = %err,
                    "log poll failed; retrying next interval"
                );
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(self.core.read_polling_interval) => {}
            }
        }
        debug!(
            log = %self.core.name,
            partition = self.partition_id,
            bucket = self.bucket_id,
            "message puller stopped"
        );
    }

    /// One poll tick: recovery-persist the cursor, read the visible window
    /// of the current timeslice, dispatch, and advance.
    pub(crate) async fn poll_once(&self) -> Result<()> {
        let cursor = self.next_timestamp.load(Ordering::SeqCst);
        if let Some(identifier) = self.core.read_marker.identifier() {
            let column = serde::marker_column(self.partition_id, self.bucket_id);
            if let Err(err) = self.core.write_setting(identifier, column, cursor).await {
                warn!(
                    log = %self.core.name,
                    partition = self.partition_id,
                    bucket = self.bucket_id,
                    error = %err,
                    "failed to persist read marker"
                );
            }
        }

        let timeslice = serde::time_slice(cursor)?;
        let slice_end = (timeslice as i64 + 1) * serde::TIMESLICE_INTERVAL_MICROS;
        let lag = self.core.read_lag_time.as_micros() as i64;
        let max_time = (self.core.clock.micros() - lag).min(slice_end);
        if max_time <= cursor {
            // Nothing visible yet. Not advancing keeps the cursor monotone.
            return Ok(());
        }

        let log_key = self
            .core
            .key_space
            .log_key(self.partition_id, self.bucket_id, timeslice)?;
        let query = KeySliceQuery::new(
            log_key.clone(),
            serde::timestamp_column(cursor),
            serde::timestamp_column(max_time),
        )
        .with_limit(self.core.max_read_msg);
        let entries = self.read_slice(query).await?;
        let saturated = entries.len() >= self.core.max_read_msg;
        let last = entries.last().cloned();
        self.dispatch(entries).await;

        let mut next = max_time;
        if saturated {
            if let Some(last) = last {
                // The limit may have truncated the window. Re-read from just
                // past the last returned column, unbounded, up to slightly
                // beyond its timestamp.
                let last_timestamp = serde::entry_timestamp(&last)?;
                next = last_timestamp + SATURATION_SLACK_MICROS;
                let follow_up = KeySliceQuery::new(
                    log_key,
                    serde::next_bigger(&last.column()),
                    serde::timestamp_column(next),
                );
                let extra = self.read_slice(follow_up).await?;
                self.dispatch(extra).await;
            }
        }
        self.next_timestamp.store(next, Ordering::SeqCst);
        Ok(())
    }

    async fn read_slice(&self, query: KeySliceQuery) -> Result<Vec<Entry>> {
        let store = Arc::clone(&self.core.store);
        backend::execute(
            "message-read",
            self.core.as_ref(),
            self.core.max_read_time,
            move |tx| {
                let store = Arc::clone(&store);
                let query = query.clone();
                async move { store.get_slice(&query, tx.as_ref()).await }.boxed()
            },
        )
        .await
    }

    /// Hands each entry to every currently registered reader.
    ///
    /// Jobs run on tracked tasks bounded by the configured reader
    /// concurrency; once shutdown has begun, late jobs run inline here
    /// instead of being dropped. A reader unregistered between decode and
    /// dispatch may still see one final message, which at-least-once
    /// delivery permits.
    async fn dispatch(&self, entries: Vec<Entry>) {
        for entry in entries {
            let message = match serde::decode_message(&entry) {
                Ok(message) => message,
                Err(err) => {
                    error!(
                        log = %self.core.name,
                        partition = self.partition_id,
                        bucket = self.bucket_id,
                        error = %err,
                        "dropping undecodable log entry"
                    );
                    continue;
                }
            };
            let readers: Vec<Arc<dyn MessageReader>> =
                self.core.readers.read().unwrap().clone();
            for reader in readers {
                let message = message.clone();
                if self.core.shutdown.is_cancelled() {
                    process(reader, message).await;
                    continue;
                }
                match Arc::clone(&self.core.dispatch_limit).acquire_owned().await {
                    Ok(permit) => {
                        self.core.dispatch_tracker.spawn(async move {
                            let _permit = permit;
                            process(reader, message).await;
                        });
                    }
                    Err(_) => process(reader, message).await,
                }
            }
        }
    }
}

async fn process(reader: Arc<dyn MessageReader>, message: Message) {
    if let Err(err) = reader.process(message).await {
        error!(error = %err, "message reader failed");
    }
}
