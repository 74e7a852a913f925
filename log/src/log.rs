//! The log: open, produce, register readers, close.
//!
//! A [`Log`] is an append-only, partitioned message log stored in a
//! key-column-value store. Producers enqueue opaque payloads and receive
//! per-message delivery futures; registered readers asynchronously consume
//! messages in approximate timestamp order with at-least-once semantics.
//!
//! Internally the log is a thin lifecycle shell around [`LogCore`], the
//! shared state that the batcher task and the pullers hold on to. The
//! pullers and the batcher own only the core, never the `Log` itself, so
//! there is no reference cycle between the log, its manager, and its
//! background tasks.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tidelog_common::{
    Clock, KeyColumnValueStore, StorageResult, StoreManager, StoreTransaction, TransactionConfig,
};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, warn};

use crate::backend::TransactionalProvider;
use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::future::{self, DeliveryFuture};
use crate::manager::LogManager;
use crate::model::{MessageReader, ReadMarker};
use crate::puller::{MessagePuller, PullerHandle};
use crate::send::{self, MessageEnvelope};
use crate::serde::{self, KeySpace};

/// Below this send delay batching cannot amortize anything; produces
/// flush inline instead.
const MIN_DELIVERY_DELAY: Duration = Duration::from_millis(10);

/// Outgoing queue capacity as a multiple of the send batch size. A full
/// queue blocks producers.
const BATCH_SIZE_MULTIPLIER: usize = 10;

/// How long close waits for the batcher to drain the queue.
const CLOSE_DOWN_WAIT: Duration = Duration::from_secs(10);

/// How long close waits for pullers and in-flight dispatch jobs.
const READER_SHUTDOWN_WAIT: Duration = Duration::from_secs(1);

/// State shared between the log, its batcher task, and its pullers.
pub(crate) struct LogCore {
    pub name: String,
    pub sender_id: String,
    pub manager: Arc<dyn LogManager>,
    pub store: Arc<dyn KeyColumnValueStore>,
    pub store_manager: Arc<dyn StoreManager>,
    pub clock: Arc<dyn Clock>,
    pub read_marker: ReadMarker,
    pub key_space: KeySpace,
    pub key_consistent: bool,
    pub default_partition_id: u32,
    pub read_partition_ids: Vec<u32>,

    pub send_batch_size: usize,
    pub max_send_delay: Duration,
    pub max_write_time: Duration,

    pub max_read_msg: usize,
    pub read_polling_interval: Duration,
    pub read_lag_time: Duration,
    pub max_read_time: Duration,

    /// Sequence counter for this sender, seeded from the settings row on
    /// open and persisted back on close.
    pub num_msg_counter: AtomicI64,
    /// Round-robin bucket assignment for produced messages.
    pub num_bucket_counter: AtomicU64,
    pub readers: RwLock<Vec<Arc<dyn MessageReader>>>,
    pub is_open: AtomicBool,
    /// Producer side of the outgoing queue. `None` when batching is
    /// disabled or the log has been closed.
    pub sender: RwLock<Option<mpsc::Sender<MessageEnvelope>>>,
    pub dispatch_limit: Arc<Semaphore>,
    pub dispatch_tracker: TaskTracker,
    pub shutdown: CancellationToken,
}

impl LogCore {
    pub(crate) fn batching_enabled(&self) -> bool {
        self.max_send_delay >= MIN_DELIVERY_DELAY
    }

    pub(crate) async fn init(
        name: String,
        manager: Arc<dyn LogManager>,
        store: Arc<dyn KeyColumnValueStore>,
        read_marker: ReadMarker,
        config: LogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let key_space = KeySpace::new(manager.partition_bit_width(), config.num_buckets)?;
        let sender_id = manager.sender_id().to_string();
        let store_manager = manager.store_manager();
        let default_partition_id = manager.default_partition_id();
        let read_partition_ids = manager.read_partition_ids();
        key_space.check_partition(default_partition_id)?;
        for &partition_id in &read_partition_ids {
            key_space.check_partition(partition_id)?;
        }
        let max_send_delay = Duration::from_millis(config.send_delay_ms);
        let core = Arc::new(LogCore {
            name,
            sender_id,
            manager,
            store,
            store_manager,
            clock,
            read_marker,
            key_space,
            key_consistent: config.key_consistent,
            default_partition_id,
            read_partition_ids,
            send_batch_size: config.send_batch_size,
            max_send_delay,
            max_write_time: Duration::from_millis(config.max_write_time_ms),
            max_read_msg: config.read_batch_size,
            read_polling_interval: Duration::from_millis(config.read_interval_ms),
            read_lag_time: Duration::from_millis(config.read_lag_time_ms) + max_send_delay,
            max_read_time: Duration::from_millis(config.max_read_time_ms),
            num_msg_counter: AtomicI64::new(0),
            num_bucket_counter: AtomicU64::new(0),
            readers: RwLock::new(Vec::new()),
            is_open: AtomicBool::new(true),
            sender: RwLock::new(None),
            dispatch_limit: Arc::new(Semaphore::new(config.read_threads)),
            dispatch_tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        });
        let seed = core
            .read_setting(&core.sender_id, serde::message_counter_column(), 0)
            .await?;
        core.num_msg_counter.store(seed, Ordering::SeqCst);
        Ok(core)
    }
}

#[async_trait]
impl TransactionalProvider for LogCore {
    async fn open_tx(&self) -> StorageResult<Box<dyn StoreTransaction>> {
        let config = if self.key_consistent {
            TransactionConfig::KeyConsistent
        } else {
            TransactionConfig::Standard
        };
        self.store_manager.begin_transaction(config).await
    }
}

struct LifecycleState {
    closed: bool,
    batcher: Option<JoinHandle<()>>,
    pullers: Vec<PullerHandle>,
}

/// A durable, partitioned, append-only message log.
///
/// Obtained from [`StandardLogManager::open_log`] or [`Log::open`]. The
/// log is created open; after [`close`](Log::close) every produce and
/// registration fails with [`Error::Closed`].
///
/// [`StandardLogManager::open_log`]: crate::StandardLogManager::open_log
pub struct Log {
    core: Arc<LogCore>,
    state: Mutex<LifecycleState>,
}

impl Log {
    /// Opens a log over the given store.
    ///
    /// Validates the configuration, seeds the send-side sequence counter
    /// from the settings row, and starts the batcher task if batching is
    /// enabled. Pullers are not created until the first reader registers.
    pub async fn open(
        name: impl Into<String>,
        manager: Arc<dyn LogManager>,
        store: Arc<dyn KeyColumnValueStore>,
        read_marker: ReadMarker,
        config: LogConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let core = LogCore::init(name.into(), manager, store, read_marker, config, clock).await?;
        let mut state = LifecycleState {
            closed: false,
            batcher: None,
            pullers: Vec::new(),
        };
        if core.batching_enabled() {
            let (sender, receiver) =
                mpsc::channel(core.send_batch_size * BATCH_SIZE_MULTIPLIER);
            *core.sender.write().unwrap() = Some(sender);
            state.batcher = Some(send::start_batcher(Arc::clone(&core), receiver));
        }
        Ok(Self {
            core,
            state: Mutex::new(state),
        })
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Produces a message onto the default partition.
    pub async fn produce(&self, payload: Bytes) -> Result<DeliveryFuture> {
        self.produce_to_partition(payload, self.core.default_partition_id)
            .await
    }

    /// Produces a message onto the partition derived from the first
    /// up-to-4 bytes of the routing key.
    pub async fn produce_with_key(
        &self,
        payload: Bytes,
        routing_key: &[u8],
    ) -> Result<DeliveryFuture> {
        let partition_id = self.core.key_space.partition_for_routing_key(routing_key);
        self.produce_to_partition(payload, partition_id).await
    }

    async fn produce_to_partition(
        &self,
        payload: Bytes,
        partition_id: u32,
    ) -> Result<DeliveryFuture> {
        if !self.core.is_open.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.core.name.clone()));
        }
        if payload.is_empty() {
            return Err(Error::InvalidArgument("message payload is empty".into()));
        }
        self.core.key_space.check_partition(partition_id)?;

        let timestamp = self.core.clock.micros();
        let bucket = ((self.core.num_bucket_counter.fetch_add(1, Ordering::SeqCst) + 1)
            % self.core.key_space.num_buckets as u64) as u32;
        let timeslice = serde::time_slice(timestamp)?;
        let key = self.core.key_space.log_key(partition_id, bucket, timeslice)?;
        let sequence = self.core.num_msg_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let entry = serde::encode_message(timestamp, &self.core.sender_id, sequence, &payload)?;
        let (promise, delivery_future) = future::delivery();
        let envelope = MessageEnvelope {
            promise,
            key,
            entry,
            timestamp_micros: timestamp,
        };

        let sender = { self.core.sender.read().unwrap().clone() };
        match sender {
            // Backpressure point: a full queue parks the producer here.
            Some(queue) => {
                if queue.send(envelope).await.is_err() {
                    return Err(Error::Closed(self.core.name.clone()));
                }
            }
            None if self.core.batching_enabled() => {
                return Err(Error::Closed(self.core.name.clone()));
            }
            // Batching disabled: flush inline. The future completes before
            // produce returns.
            None => send::flush(&self.core, vec![envelope]).await?,
        }
        Ok(delivery_future)
    }

    /// Registers a single reader. See [`register_readers`](Log::register_readers).
    pub async fn register_reader(&self, reader: Arc<dyn MessageReader>) -> Result<()> {
        self.register_readers(vec![reader]).await
    }

    /// Registers readers, skipping ones already present.
    ///
    /// The first successful registration creates one puller per
    /// (read-partition, bucket) and starts polling after a short initial
    /// delay. Later registrations join the running pullers.
    pub async fn register_readers(&self, readers: Vec<Arc<dyn MessageReader>>) -> Result<()> {
        if readers.is_empty() {
            return Err(Error::InvalidArgument(
                "must register at least one reader".into(),
            ));
        }
        let mut state = self.state.lock().await;
        if state.closed || !self.core.is_open.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.core.name.clone()));
        }
        let first_registration = {
            let mut list = self.core.readers.write().unwrap();
            let was_empty = list.is_empty();
            for reader in readers {
                if !list.iter().any(|existing| Arc::ptr_eq(existing, &reader)) {
                    list.push(reader);
                }
            }
            was_empty && !list.is_empty()
        };
        if first_registration {
            for partition_id in self.core.read_partition_ids.clone() {
                for bucket_id in 0..self.core.key_space.num_buckets {
                    let handle =
                        MessagePuller::spawn(Arc::clone(&self.core), partition_id, bucket_id)
                            .await?;
                    state.pullers.push(handle);
                }
            }
        }
        Ok(())
    }

    /// Removes a reader, returning whether it was registered. Running
    /// pullers keep polling; a dispatch already in flight may still hand
    /// the removed reader one final message.
    pub async fn unregister_reader(&self, reader: &Arc<dyn MessageReader>) -> Result<bool> {
        if !self.core.is_open.load(Ordering::SeqCst) {
            return Err(Error::Closed(self.core.name.clone()));
        }
        let mut list = self.core.readers.write().unwrap();
        let before = list.len();
        list.retain(|existing| !Arc::ptr_eq(existing, reader));
        Ok(list.len() < before)
    }

    /// Closes the log.
    ///
    /// Stops the pullers (waiting briefly, then cancelling), drains the
    /// batcher with a generous window, persists every puller's cursor and
    /// the sequence counter, closes the store, and notifies the manager.
    /// Closing an already closed log is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        self.core.is_open.store(false, Ordering::SeqCst);

        // Reader side first: stop the pullers, then let in-flight
        // dispatch jobs finish.
        self.core.shutdown.cancel();
        let mut pullers = std::mem::take(&mut state.pullers);
        let drained = timeout(READER_SHUTDOWN_WAIT, async {
            for handle in pullers.iter_mut() {
                let _ = (&mut handle.task).await;
            }
            self.core.dispatch_tracker.close();
            self.core.dispatch_tracker.wait().await;
        })
        .await
        .is_ok();
        if !drained {
            for handle in &pullers {
                handle.task.abort();
            }
            error!(
                log = %self.core.name,
                "reader tasks did not stop in time; skipping cursor persistence"
            );
        }

        // Dropping the queue sender lets the batcher drain and exit.
        let sender = self.core.sender.write().unwrap().take();
        drop(sender);
        if let Some(mut batcher) = state.batcher.take() {
            if timeout(CLOSE_DOWN_WAIT, &mut batcher).await.is_err() {
                batcher.abort();
                error!(
                    log = %self.core.name,
                    "send batcher did not drain in time; queued messages were dropped"
                );
            }
        }

        if drained {
            for handle in &pullers {
                if let Err(err) = handle.persist_cursor(&self.core).await {
                    warn!(
                        log = %self.core.name,
                        partition = handle.partition_id,
                        bucket = handle.bucket_id,
                        error = %err,
                        "failed to persist read cursor on close"
                    );
                }
            }
        }
        self.core
            .write_setting(
                &self.core.sender_id,
                serde::message_counter_column(),
                self.core.num_msg_counter.load(Ordering::SeqCst),
            )
            .await?;
        self.core.store.close().await?;
        self.core.manager.closed_log(&self.core.name).await;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use tidelog_common::store::in_memory::InMemoryStoreManager;
    use tidelog_common::{KeySliceQuery, MockClock};

    use super::test_support::{inline_config, TestManager};
    use super::*;

    async fn open_inline_log() -> (Log, Arc<dyn StoreManager>) {
        let store_manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
        let log = open_log_with(Arc::clone(&store_manager), inline_config(1024), 10_000_000).await;
        (log, store_manager)
    }

    async fn open_log_with(
        store_manager: Arc<dyn StoreManager>,
        config: LogConfig,
        clock_micros: i64,
    ) -> Log {
        let manager = Arc::new(TestManager {
            sender_id: "s1".to_string(),
            partition_bit_width: 8,
            default_partition_id: 0,
            read_partition_ids: vec![0],
            store_manager: Arc::clone(&store_manager),
        });
        let store = store_manager.open_store("test-log").await.unwrap();
        Log::open(
            "test-log",
            manager,
            store,
            ReadMarker::from_time(0),
            config,
            Arc::new(MockClock::at_micros(clock_micros)),
        )
        .await
        .unwrap()
    }

    async fn row_entries(
        store_manager: &Arc<dyn StoreManager>,
        partition_id: u32,
        bucket_id: u32,
        timeslice: u32,
    ) -> Vec<tidelog_common::Entry> {
        let store = store_manager.open_store("test-log").await.unwrap();
        let key_space = KeySpace::new(8, 2).unwrap();
        let key = key_space.log_key(partition_id, bucket_id, timeslice).unwrap();
        let query = KeySliceQuery::new(
            key,
            serde::timestamp_column(0),
            serde::timestamp_column(i64::MAX),
        );
        let tx = store_manager
            .begin_transaction(TransactionConfig::Standard)
            .await
            .unwrap();
        store.get_slice(&query, tx.as_ref()).await.unwrap()
    }

    #[tokio::test]
    async fn should_flush_inline_and_complete_future_before_return() {
        // given - a send delay below the batching threshold
        let (log, store_manager) = open_inline_log().await;

        // when
        let delivery = log
            .produce(Bytes::from_static(&[0xDE, 0xAD]))
            .await
            .unwrap();

        // then - the future is already resolved
        delivery.wait().await.unwrap();
        // message sits in the row for the clock's timeslice (10s -> slice 0)
        let entries = row_entries(&store_manager, 0, 0, 0).await;
        assert_eq!(entries.len(), 1);
        let message = serde::decode_message(&entries[0]).unwrap();
        assert_eq!(message.payload, Bytes::from_static(&[0xDE, 0xAD]));
        assert_eq!(message.timestamp_micros, 10_000_000);
        assert_eq!(message.sender_id, "s1");
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_place_message_in_timeslice_of_its_timestamp() {
        // given - a clock several timeslices in
        let store_manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
        let now = 3 * serde::TIMESLICE_INTERVAL_MICROS + 17;
        let log = open_log_with(Arc::clone(&store_manager), inline_config(1024), now).await;

        // when
        log.produce(Bytes::from_static(b"x"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        // then - the row key's timeslice field is timestamp / interval
        let entries = row_entries(&store_manager, 0, 0, 3).await;
        assert_eq!(entries.len(), 1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_round_robin_buckets() {
        // given - two buckets
        let store_manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
        let config = LogConfig {
            num_buckets: 2,
            ..inline_config(1024)
        };
        let log = open_log_with(Arc::clone(&store_manager), config, 10_000_000).await;

        // when
        log.produce(Bytes::from_static(b"first"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        log.produce(Bytes::from_static(b"second"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        // then - one message per bucket
        assert_eq!(row_entries(&store_manager, 0, 0, 0).await.len(), 1);
        assert_eq!(row_entries(&store_manager, 0, 1, 0).await.len(), 1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_assign_strictly_increasing_sequence_numbers() {
        // given
        let (log, store_manager) = open_inline_log().await;

        // when - same frozen timestamp, so column order falls back to the
        // sequence tie-break
        for payload in [b"a" as &[u8], b"b", b"c"] {
            log.produce(Bytes::copy_from_slice(payload))
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
        }

        // then
        let entries = row_entries(&store_manager, 0, 0, 0).await;
        assert_eq!(entries.len(), 3);
        let payloads: Vec<Bytes> = entries.iter().map(|e| e.value()).collect();
        assert_eq!(
            payloads,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_persist_sequence_counter_across_reopen() {
        // given - a log that produced three messages and closed
        let store_manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
        let log = open_log_with(Arc::clone(&store_manager), inline_config(1024), 10_000_000).await;
        for _ in 0..3 {
            log.produce(Bytes::from_static(b"m"))
                .await
                .unwrap()
                .wait()
                .await
                .unwrap();
        }
        log.close().await.unwrap();

        // when - reopening with the same sender against the same store
        let reopened =
            open_log_with(Arc::clone(&store_manager), inline_config(1024), 20_000_000).await;

        // then - the counter resumes past the persisted value
        assert_eq!(reopened.core.num_msg_counter.load(Ordering::SeqCst), 3);
        reopened.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_empty_payload() {
        // given
        let (log, _) = open_inline_log().await;

        // when
        let result = log.produce(Bytes::new()).await;

        // then
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_out_of_range_partition() {
        // given - bit width 8 allows partitions 0..=255
        let (log, _) = open_inline_log().await;

        // when
        let result = log
            .produce_to_partition(Bytes::from_static(b"x"), 256)
            .await;

        // then
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_reject_produce_after_close() {
        // given
        let (log, _) = open_inline_log().await;
        log.close().await.unwrap();

        // when
        let result = log.produce(Bytes::from_static(b"x")).await;

        // then
        assert!(matches!(result, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn should_reject_registration_after_close() {
        // given
        let (log, _) = open_inline_log().await;
        log.close().await.unwrap();

        // when
        let (reader, _) = super::test_support::collecting_reader();
        let result = log.register_reader(reader).await;

        // then
        assert!(matches!(result, Err(Error::Closed(_))));
    }

    #[tokio::test]
    async fn should_reject_empty_registration() {
        // given
        let (log, _) = open_inline_log().await;

        // when
        let result = log.register_readers(Vec::new()).await;

        // then
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_deduplicate_registered_readers() {
        // given
        let (log, _) = open_inline_log().await;
        let (reader, _) = super::test_support::collecting_reader();

        // when - same reader registered twice
        log.register_reader(Arc::clone(&reader)).await.unwrap();
        log.register_reader(Arc::clone(&reader)).await.unwrap();

        // then
        assert_eq!(log.core.readers.read().unwrap().len(), 1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_unregister_reader_once() {
        // given
        let (log, _) = open_inline_log().await;
        let (reader, _) = super::test_support::collecting_reader();
        log.register_reader(Arc::clone(&reader)).await.unwrap();

        // when/then
        assert!(log.unregister_reader(&reader).await.unwrap());
        assert!(!log.unregister_reader(&reader).await.unwrap());
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_close_idempotently() {
        // given
        let (log, _) = open_inline_log().await;

        // when/then
        log.close().await.unwrap();
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn should_create_pullers_on_first_registration_only() {
        // given - two buckets, one read partition
        let store_manager: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
        let config = LogConfig {
            num_buckets: 2,
            ..inline_config(1024)
        };
        let log = open_log_with(Arc::clone(&store_manager), config, 10_000_000).await;
        let (reader_a, _) = super::test_support::collecting_reader();
        let (reader_b, _) = super::test_support::collecting_reader();

        // when
        log.register_reader(reader_a).await.unwrap();
        log.register_reader(reader_b).await.unwrap();

        // then - one puller per (partition, bucket), created once
        assert_eq!(log.state.lock().await.pullers.len(), 2);
        log.close().await.unwrap();
    }
}
