//! 8-byte counter settings persisted in the reserved system partition.
//!
//! Two kinds of counters live here: the send-side message counter (one per
//! sender id) and the read cursors (one per reader identifier, partition
//! and bucket). They are the only state that survives a restart.

use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use tidelog_common::{Entry, KeySliceQuery};

use crate::backend;
use crate::error::Result;
use crate::log::LogCore;
use crate::serde;

impl LogCore {
    /// Reads the counter at `(setting_key(identifier), column)`, returning
    /// `default` when absent. A value of any length other than 8 is fatal.
    pub(crate) async fn read_setting(
        &self,
        identifier: &str,
        column: Bytes,
        default: i64,
    ) -> Result<i64> {
        let key = serde::setting_key(identifier)?;
        let end = serde::next_bigger(&column);
        let query = KeySliceQuery::new(key, column, end).with_limit(1);
        let store = Arc::clone(&self.store);
        let entries = backend::execute("setting-read", self, self.max_read_time, move |tx| {
            let store = Arc::clone(&store);
            let query = query.clone();
            async move { store.get_slice(&query, tx.as_ref()).await }.boxed()
        })
        .await?;
        match entries.first() {
            Some(entry) => serde::decode_counter(&entry.value()),
            None => Ok(default),
        }
    }

    /// Upserts the 8-byte big-endian counter at
    /// `(setting_key(identifier), column)`.
    pub(crate) async fn write_setting(
        &self,
        identifier: &str,
        column: Bytes,
        value: i64,
    ) -> Result<()> {
        let key = serde::setting_key(identifier)?;
        let entry = Entry::of(column, serde::encode_counter(value));
        let store = Arc::clone(&self.store);
        backend::execute("setting-write", self, self.max_write_time, move |tx| {
            let store = Arc::clone(&store);
            let key = key.clone();
            let entry = entry.clone();
            async move {
                store
                    .mutate(key, vec![entry], Vec::new(), tx.as_ref())
                    .await
            }
            .boxed()
        })
        .await
    }
}
