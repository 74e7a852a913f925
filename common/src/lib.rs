pub mod clock;
pub mod store;

pub use clock::{Clock, MockClock, SystemClock};
pub use store::in_memory::{InMemoryStore, InMemoryStoreManager};
pub use store::{
    Entry, KcvMutation, KeyColumnValueStore, KeySliceQuery, StorageError, StorageResult,
    StoreFeatures, StoreManager, StoreTransaction, TransactionConfig,
};
