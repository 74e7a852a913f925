//! In-memory KCV backend for development and testing.
//!
//! Rows are column-sorted maps, so slice reads come back in column order
//! without extra sorting. Transactions are no-ops: every mutation is applied
//! immediately and commit/rollback succeed unconditionally.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;

use super::{
    Entry, KcvMutation, KeyColumnValueStore, KeySliceQuery, StorageError, StorageResult,
    StoreFeatures, StoreManager, StoreTransaction, TransactionConfig,
};

/// Backend holding all stores in process memory.
pub struct InMemoryStoreManager {
    features: StoreFeatures,
    stores: RwLock<HashMap<String, Arc<InMemoryStore>>>,
}

impl InMemoryStoreManager {
    pub fn new() -> Self {
        Self::with_features(StoreFeatures {
            batch_mutation: true,
            key_consistent_transactions: true,
        })
    }

    /// A manager advertising the given feature set. Useful for exercising
    /// the per-key mutation fallback of callers that prefer batch mutation.
    pub fn with_features(features: StoreFeatures) -> Self {
        Self {
            features,
            stores: RwLock::new(HashMap::new()),
        }
    }

    fn store(&self, name: &str) -> StorageResult<Arc<InMemoryStore>> {
        self.stores
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::Permanent(format!("unknown store: {name}")))
    }
}

impl Default for InMemoryStoreManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreManager for InMemoryStoreManager {
    fn features(&self) -> StoreFeatures {
        self.features
    }

    async fn begin_transaction(
        &self,
        _config: TransactionConfig,
    ) -> StorageResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(NoopTransaction))
    }

    async fn open_store(&self, name: &str) -> StorageResult<Arc<dyn KeyColumnValueStore>> {
        let mut stores = self.stores.write().unwrap();
        let store = stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryStore::new(name)))
            .clone();
        Ok(store)
    }

    async fn mutate_many(
        &self,
        mutations: HashMap<String, HashMap<Bytes, KcvMutation>>,
        _tx: &dyn StoreTransaction,
    ) -> StorageResult<()> {
        for (store_name, per_key) in mutations {
            let store = self.store(&store_name)?;
            for (key, mutation) in per_key {
                store.apply(key, mutation.additions, mutation.deletions);
            }
        }
        Ok(())
    }
}

struct NoopTransaction;

#[async_trait]
impl StoreTransaction for NoopTransaction {
    async fn commit(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn rollback(&self) -> StorageResult<()> {
        Ok(())
    }
}

/// A single in-memory store: row key -> sorted columns.
pub struct InMemoryStore {
    name: String,
    rows: RwLock<HashMap<Bytes, BTreeMap<Bytes, Bytes>>>,
}

impl InMemoryStore {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            rows: RwLock::new(HashMap::new()),
        }
    }

    fn apply(&self, key: Bytes, additions: Vec<Entry>, deletions: Vec<Bytes>) {
        let mut rows = self.rows.write().unwrap();
        let row = rows.entry(key).or_default();
        for column in deletions {
            row.remove(&column);
        }
        for entry in additions {
            row.insert(entry.column(), entry.value());
        }
    }
}

#[async_trait]
impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn mutate(
        &self,
        key: Bytes,
        additions: Vec<Entry>,
        deletions: Vec<Bytes>,
        _tx: &dyn StoreTransaction,
    ) -> StorageResult<()> {
        self.apply(key, additions, deletions);
        Ok(())
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        _tx: &dyn StoreTransaction,
    ) -> StorageResult<Vec<Entry>> {
        if query.column_start >= query.column_end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().unwrap();
        let Some(row) = rows.get(&query.key) else {
            return Ok(Vec::new());
        };
        let mut entries: Vec<Entry> = row
            .range(query.column_start.clone()..query.column_end.clone())
            .map(|(column, value)| Entry::of(column.clone(), value.clone()))
            .collect();
        if let Some(limit) = query.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
