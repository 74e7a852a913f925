//! The batching send path.
//!
//! Produced messages are wrapped in envelopes and pushed onto a bounded
//! queue; a single batcher task coalesces them into multi-key mutations
//! under two deadlines: the age of the oldest queued message
//! (`send_delay`) and the batch size (`send_batch_size`). The queue bound
//! of `send_batch_size × 10` is the backpressure point: a full queue makes
//! `produce` wait.
//!
//! A flush settles every envelope's delivery future: `delivered` on
//! success, `failed` with the shared cause otherwise. Failed envelopes are
//! dropped; the next batch is independent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tidelog_common::{Entry, KcvMutation};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error};

use crate::backend;
use crate::error::{Error, Result};
use crate::future::DeliveryPromise;
use crate::log::LogCore;

/// A message staged for writing: its delivery promise, row key, and
/// encoded entry.
pub(crate) struct MessageEnvelope {
    pub promise: DeliveryPromise,
    pub key: Bytes,
    pub entry: Entry,
    pub timestamp_micros: i64,
}

pub(crate) fn start_batcher(
    core: Arc<LogCore>,
    receiver: mpsc::Receiver<MessageEnvelope>,
) -> JoinHandle<()> {
    tokio::spawn(batcher_loop(core, receiver))
}

async fn batcher_loop(core: Arc<LogCore>, mut receiver: mpsc::Receiver<MessageEnvelope>) {
    let mut batch: Vec<MessageEnvelope> = Vec::with_capacity(core.send_batch_size * 3 / 2);
    loop {
        // Wait for traffic: indefinitely while the batch is empty, else at
        // most until the oldest queued message hits its send delay.
        let received = if batch.is_empty() {
            match receiver.recv().await {
                Some(envelope) => Some(envelope),
                None => break,
            }
        } else {
            let wait = core.max_send_delay.saturating_sub(age_of_first(&core, &batch));
            match timeout(wait, receiver.recv()).await {
                Ok(Some(envelope)) => Some(envelope),
                Ok(None) => break,
                Err(_elapsed) => None,
            }
        };
        if let Some(envelope) = received {
            batch.push(envelope);
        }
        // Opportunistically top the batch up without blocking.
        while batch.len() < core.send_batch_size {
            match receiver.try_recv() {
                Ok(envelope) => batch.push(envelope),
                Err(_) => break,
            }
        }
        if !batch.is_empty()
            && (age_of_first(&core, &batch) >= core.max_send_delay
                || batch.len() >= core.send_batch_size)
        {
            let to_send = std::mem::take(&mut batch);
            if let Err(err) = flush(&core, to_send).await {
                error!(log = %core.name, error = %err, "failed to flush message batch");
            }
        }
    }
    // Shutdown: the sender is gone. Flush whatever is still pending in
    // batch-size chunks so queued messages are not silently dropped.
    while let Ok(envelope) = receiver.try_recv() {
        batch.push(envelope);
    }
    while !batch.is_empty() {
        let take = batch.len().min(core.send_batch_size);
        let chunk: Vec<MessageEnvelope> = batch.drain(..take).collect();
        if let Err(err) = flush(&core, chunk).await {
            error!(log = %core.name, error = %err, "failed to flush batch during shutdown");
        }
    }
    debug!(log = %core.name, "send batcher stopped");
}

fn age_of_first(core: &LogCore, batch: &[MessageEnvelope]) -> Duration {
    let oldest = batch[0].timestamp_micros;
    let age_micros = (core.clock.micros() - oldest).max(0);
    Duration::from_micros(age_micros as u64)
}

/// Writes the envelopes in one transaction and settles their futures.
///
/// Envelopes are grouped by row key with insertion order preserved within a
/// key. Stores advertising batch mutation get one multi-key call; others
/// get one mutation per key inside the same transaction.
pub(crate) async fn flush(core: &LogCore, envelopes: Vec<MessageEnvelope>) -> Result<()> {
    if envelopes.is_empty() {
        return Ok(());
    }
    let mut key_order: Vec<Bytes> = Vec::new();
    let mut grouped: HashMap<Bytes, Vec<Entry>> = HashMap::new();
    for envelope in &envelopes {
        if !grouped.contains_key(&envelope.key) {
            key_order.push(envelope.key.clone());
        }
        grouped
            .entry(envelope.key.clone())
            .or_default()
            .push(envelope.entry.clone());
    }
    let grouped = Arc::new(grouped);
    let key_order = Arc::new(key_order);
    let batch_mutation = core.store_manager.features().batch_mutation;
    let store = Arc::clone(&core.store);
    let store_manager = Arc::clone(&core.store_manager);
    let store_name = core.store.name().to_string();

    let result = backend::execute("message-send", core, core.max_write_time, move |tx| {
        let grouped = Arc::clone(&grouped);
        let key_order = Arc::clone(&key_order);
        let store = Arc::clone(&store);
        let store_manager = Arc::clone(&store_manager);
        let store_name = store_name.clone();
        async move {
            if batch_mutation {
                let per_key: HashMap<Bytes, KcvMutation> = grouped
                    .iter()
                    .map(|(key, entries)| (key.clone(), KcvMutation::additions(entries.clone())))
                    .collect();
                store_manager
                    .mutate_many(HashMap::from([(store_name, per_key)]), tx.as_ref())
                    .await
            } else {
                for key in key_order.iter() {
                    store
                        .mutate(key.clone(), grouped[key].clone(), Vec::new(), tx.as_ref())
                        .await?;
                }
                Ok(())
            }
        }
        .boxed()
    })
    .await;

    match result {
        Ok(()) => {
            debug!(log = %core.name, count = envelopes.len(), "wrote messages to backend");
            for envelope in envelopes {
                envelope.promise.delivered();
            }
            Ok(())
        }
        Err(err) => {
            let cause = Arc::new(err);
            for envelope in envelopes {
                envelope.promise.failed(Arc::clone(&cause));
            }
            Err(Error::DeliveryFailed(cause))
        }
    }
}

#[cfg(test)]
mod tests {
    use tidelog_common::{KeySliceQuery, StoreFeatures, TransactionConfig};

    use super::*;
    use crate::future;
    use crate::log::test_support;
    use crate::serde;

    fn envelope(core: &LogCore, partition: u32, timestamp: i64, payload: &'static [u8]) -> (MessageEnvelope, crate::DeliveryFuture) {
        let timeslice = serde::time_slice(timestamp).unwrap();
        let key = core.key_space.log_key(partition, 0, timeslice).unwrap();
        let entry =
            serde::encode_message(timestamp, &core.sender_id, 1, &Bytes::from_static(payload))
                .unwrap();
        let (promise, delivery_future) = future::delivery();
        (
            MessageEnvelope {
                promise,
                key,
                entry,
                timestamp_micros: timestamp,
            },
            delivery_future,
        )
    }

    async fn slice(core: &LogCore, partition: u32, timeslice: u32) -> Vec<Entry> {
        let key = core.key_space.log_key(partition, 0, timeslice).unwrap();
        let query = KeySliceQuery::new(key, serde::timestamp_column(0), serde::timestamp_column(i64::MAX));
        let tx = core
            .store_manager
            .begin_transaction(TransactionConfig::Standard)
            .await
            .unwrap();
        core.store.get_slice(&query, tx.as_ref()).await.unwrap()
    }

    #[tokio::test]
    async fn should_write_envelopes_and_deliver_futures() {
        // given
        let core = test_support::core().await;
        let (env_a, fut_a) = envelope(&core, 0, 100, b"a");
        let (env_b, fut_b) = envelope(&core, 0, 101, b"b");

        // when
        flush(&core, vec![env_a, env_b]).await.unwrap();

        // then - both futures delivered, both entries in the row
        fut_a.wait().await.unwrap();
        fut_b.wait().await.unwrap();
        let entries = slice(&core, 0, 0).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].value(), Bytes::from_static(b"a"));
        assert_eq!(entries[1].value(), Bytes::from_static(b"b"));
    }

    #[tokio::test]
    async fn should_group_envelopes_across_partitions() {
        // given - messages for two partitions in one flush
        let core = test_support::core().await;
        let (env_a, fut_a) = envelope(&core, 0, 100, b"p0");
        let (env_b, fut_b) = envelope(&core, 1, 100, b"p1");

        // when
        flush(&core, vec![env_a, env_b]).await.unwrap();

        // then
        fut_a.wait().await.unwrap();
        fut_b.wait().await.unwrap();
        assert_eq!(slice(&core, 0, 0).await.len(), 1);
        assert_eq!(slice(&core, 1, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn should_fall_back_to_per_key_mutations() {
        // given - a store without batch mutation
        let core = test_support::core_with_features(StoreFeatures {
            batch_mutation: false,
            key_consistent_transactions: false,
        })
        .await;
        let (env_a, fut_a) = envelope(&core, 0, 100, b"a");
        let (env_b, fut_b) = envelope(&core, 1, 100, b"b");

        // when
        flush(&core, vec![env_a, env_b]).await.unwrap();

        // then
        fut_a.wait().await.unwrap();
        fut_b.wait().await.unwrap();
        assert_eq!(slice(&core, 0, 0).await.len(), 1);
        assert_eq!(slice(&core, 1, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn should_fail_every_future_when_flush_fails() {
        // given - a backend that always fails permanently
        let core = test_support::failing_core().await;
        let (env_a, fut_a) = envelope(&core, 0, 100, b"a");
        let (env_b, fut_b) = envelope(&core, 0, 101, b"b");

        // when
        let result = flush(&core, vec![env_a, env_b]).await;

        // then - the flush errors and both futures fail with the shared cause
        assert!(matches!(result, Err(Error::DeliveryFailed(_))));
        assert!(matches!(
            fut_a.wait().await,
            Err(Error::DeliveryFailed(_))
        ));
        assert!(matches!(
            fut_b.wait().await,
            Err(Error::DeliveryFailed(_))
        ));
    }

    #[tokio::test]
    async fn should_accept_empty_flush() {
        // given
        let core = test_support::core().await;

        // when/then
        flush(&core, Vec::new()).await.unwrap();
    }
}
