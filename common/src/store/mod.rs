//! The key-column-value store interface.
//!
//! A KCV store maps a row key to a set of columns sorted lexicographically,
//! each column carrying a value. The log consumes the store exclusively
//! through the traits in this module, so any backend that can perform keyed
//! column mutations and ordered column-range reads inside a transaction can
//! host a log. An in-memory backend for development and testing lives in
//! [`in_memory`].
//!
//! Storage failures are classified as temporary (worth retrying) or
//! permanent (fatal); callers above the retry layer only ever see errors
//! that survived classification.

pub mod in_memory;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// A transient failure. The operation may succeed if retried.
    #[error("temporary storage failure: {0}")]
    Temporary(String),

    /// A non-recoverable failure. Retrying will not help.
    #[error("permanent storage failure: {0}")]
    Permanent(String),
}

impl StorageError {
    pub fn is_temporary(&self) -> bool {
        matches!(self, StorageError::Temporary(_))
    }
}

/// A single column-value pair within a row.
///
/// The column and value are held in one contiguous buffer with the split
/// position recorded, so an entry assembled by a writer round-trips through
/// the store without re-slicing costs:
///
/// ```text
/// | column bytes ... | value bytes ... |
///                    ^ value_pos
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    data: Bytes,
    value_pos: usize,
}

impl Entry {
    /// Creates an entry from a combined buffer and the column/value split
    /// position. `value_pos` must be within the buffer.
    pub fn new(data: Bytes, value_pos: usize) -> Self {
        assert!(value_pos <= data.len(), "value position out of bounds");
        Self { data, value_pos }
    }

    /// Creates an entry from separate column and value buffers.
    pub fn of(column: Bytes, value: Bytes) -> Self {
        let value_pos = column.len();
        let mut data = bytes::BytesMut::with_capacity(column.len() + value.len());
        data.extend_from_slice(&column);
        data.extend_from_slice(&value);
        Self {
            data: data.freeze(),
            value_pos,
        }
    }

    pub fn column(&self) -> Bytes {
        self.data.slice(..self.value_pos)
    }

    pub fn value(&self) -> Bytes {
        self.data.slice(self.value_pos..)
    }
}

/// An ordered column-range read against a single row key.
///
/// The column range is inclusive at the start and exclusive at the end.
/// A limit caps the number of entries returned, smallest columns first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: Bytes,
    pub column_start: Bytes,
    pub column_end: Bytes,
    pub limit: Option<usize>,
}

impl KeySliceQuery {
    pub fn new(key: Bytes, column_start: Bytes, column_end: Bytes) -> Self {
        Self {
            key,
            column_start,
            column_end,
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Column additions and deletions for one row key.
///
/// Deletions are applied before additions, so a mutation that deletes and
/// re-adds the same column leaves the added value in place.
#[derive(Debug, Clone, Default)]
pub struct KcvMutation {
    pub additions: Vec<Entry>,
    pub deletions: Vec<Bytes>,
}

impl KcvMutation {
    pub fn additions(additions: Vec<Entry>) -> Self {
        Self {
            additions,
            deletions: Vec::new(),
        }
    }
}

/// Capabilities advertised by a store backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreFeatures {
    /// Whether [`StoreManager::mutate_many`] applies a multi-key mutation
    /// natively in one call.
    pub batch_mutation: bool,
    /// Whether the backend offers key-consistent transactions.
    pub key_consistent_transactions: bool,
}

/// Consistency level requested when opening a transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionConfig {
    #[default]
    Standard,
    KeyConsistent,
}

#[async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn commit(&self) -> StorageResult<()>;

    async fn rollback(&self) -> StorageResult<()>;
}

/// A single named store within a backend.
#[async_trait]
pub trait KeyColumnValueStore: Send + Sync {
    fn name(&self) -> &str;

    /// Applies deletions then additions to the columns of `key`.
    async fn mutate(
        &self,
        key: Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        tx: &dyn StoreTransaction,
    ) -> StorageResult<()>;

    /// Returns the entries of the query's column range in column order.
    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        tx: &dyn StoreTransaction,
    ) -> StorageResult<Vec<Entry>>;

    async fn close(&self) -> StorageResult<()>;
}

/// A store backend: a factory for named stores and transactions.
#[async_trait]
pub trait StoreManager: Send + Sync {
    fn features(&self) -> StoreFeatures;

    async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> StorageResult<Box<dyn StoreTransaction>>;

    /// Opens (creating if necessary) the store with the given name.
    async fn open_store(&self, name: &str) -> StorageResult<Arc<dyn KeyColumnValueStore>>;

    /// Applies mutations across several keys of several stores in one call.
    ///
    /// The outer map is keyed by store name. Backends advertising
    /// [`StoreFeatures::batch_mutation`] apply the whole map natively.
    async fn mutate_many(
        &self,
        mutations: HashMap<String, HashMap<Bytes, KcvMutation>>,
        tx: &dyn StoreTransaction,
    ) -> StorageResult<()>;
}
