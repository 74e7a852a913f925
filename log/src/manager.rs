//! Log managers.
//!
//! A log consumes its manager only through the narrow [`LogManager`]
//! capability trait: sender identity, partition geometry, the store
//! backend, and a close notification. [`StandardLogManager`] is the stock
//! implementation, owning logs by name so each name is open at most once
//! per manager.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tidelog_common::{Clock, StoreManager, SystemClock};
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::LogConfig;
use crate::error::{Error, Result};
use crate::log::Log;
use crate::model::ReadMarker;

/// What a log needs from the manager that owns it.
#[async_trait]
pub trait LogManager: Send + Sync {
    /// Identity written into every message this process produces.
    fn sender_id(&self) -> &str;

    /// How many upper bits of the key's first field carry the partition
    /// id. Must be in `[0, 32]`.
    fn partition_bit_width(&self) -> u32;

    /// Partition used by `produce` calls without a routing key.
    fn default_partition_id(&self) -> u32;

    /// Partitions this process consumes.
    fn read_partition_ids(&self) -> Vec<u32>;

    fn store_manager(&self) -> Arc<dyn StoreManager>;

    /// Invoked by [`Log::close`] once the log has fully shut down.
    async fn closed_log(&self, _name: &str) {}
}

/// The stock manager: opens logs against a store backend and tracks which
/// names are currently open.
pub struct StandardLogManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    sender_id: String,
    partition_bit_width: u32,
    default_partition_id: u32,
    read_partition_ids: Vec<u32>,
    store_manager: Arc<dyn StoreManager>,
    clock: Arc<dyn Clock>,
    open_logs: Mutex<HashSet<String>>,
}

impl StandardLogManager {
    /// An unpartitioned manager: bit width 0, every message on partition 0.
    pub fn new(store_manager: Arc<dyn StoreManager>, sender_id: impl Into<String>) -> Self {
        Self::with_partitions(store_manager, sender_id, 0, 0, vec![0])
            .expect("an unpartitioned manager is always valid")
    }

    /// A partitioned manager. `partition_bit_width` must be in `[0, 32]`
    /// and every partition id must fit into that many bits.
    pub fn with_partitions(
        store_manager: Arc<dyn StoreManager>,
        sender_id: impl Into<String>,
        partition_bit_width: u32,
        default_partition_id: u32,
        read_partition_ids: Vec<u32>,
    ) -> Result<Self> {
        if partition_bit_width > 32 {
            return Err(Error::InvalidArgument(format!(
                "partition bit width must be in [0, 32], got {partition_bit_width}"
            )));
        }
        let max = 1u64 << partition_bit_width;
        for &partition_id in read_partition_ids.iter().chain([&default_partition_id]) {
            if (partition_id as u64) >= max {
                return Err(Error::InvalidArgument(format!(
                    "partition id {partition_id} does not fit into {partition_bit_width} bits"
                )));
            }
        }
        Ok(Self {
            inner: Arc::new(ManagerInner {
                sender_id: sender_id.into(),
                partition_bit_width,
                default_partition_id,
                read_partition_ids,
                store_manager,
                clock: Arc::new(SystemClock),
                open_logs: Mutex::new(HashSet::new()),
            }),
        })
    }

    /// Opens the named log, creating its backing store if necessary.
    ///
    /// Each name can be open at most once per manager; the slot frees up
    /// again once [`Log::close`] has completed.
    pub async fn open_log(
        &self,
        name: impl Into<String>,
        read_marker: ReadMarker,
        config: LogConfig,
    ) -> Result<Log> {
        let name = name.into();
        {
            let mut open = self.inner.open_logs.lock().await;
            if !open.insert(name.clone()) {
                return Err(Error::InvalidArgument(format!(
                    "log `{name}` is already open"
                )));
            }
        }
        let result = self.open_log_inner(&name, read_marker, config).await;
        if result.is_err() {
            self.inner.open_logs.lock().await.remove(&name);
        }
        result
    }

    async fn open_log_inner(
        &self,
        name: &str,
        read_marker: ReadMarker,
        config: LogConfig,
    ) -> Result<Log> {
        let store = self.inner.store_manager.open_store(name).await?;
        debug!(log = name, "opening log");
        Log::open(
            name.to_string(),
            Arc::clone(&self.inner) as Arc<dyn LogManager>,
            store,
            read_marker,
            config,
            Arc::clone(&self.inner.clock),
        )
        .await
    }
}

#[async_trait]
impl LogManager for ManagerInner {
    fn sender_id(&self) -> &str {
        &self.sender_id
    }

    fn partition_bit_width(&self) -> u32 {
        self.partition_bit_width
    }

    fn default_partition_id(&self) -> u32 {
        self.default_partition_id
    }

    fn read_partition_ids(&self) -> Vec<u32> {
        self.read_partition_ids.clone()
    }

    fn store_manager(&self) -> Arc<dyn StoreManager> {
        Arc::clone(&self.store_manager)
    }

    async fn closed_log(&self, name: &str) {
        self.open_logs.lock().await.remove(name);
        debug!(log = name, "log closed");
    }
}
