//! Tidelog - a durable, partitioned, append-only message log on a
//! key-column-value store.
//!
//! Producers enqueue opaque binary messages; registered readers consume
//! them asynchronously in approximate timestamp order with at-least-once
//! delivery. Read positions are persisted in the same store, so consumers
//! resume where they left off after a restart.
//!
//! # Key scheme
//!
//! The monotonically growing message stream is mapped onto a fixed-width
//! key space: each message lands under a 12-byte row key of
//! (partition, bucket, timeslice), where the timeslice is its timestamp
//! divided into 100-second windows and the bucket is assigned round-robin.
//! Writes stay load-balanced across buckets while reads remain cheap
//! column-range scans over one row per poll.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use bytes::Bytes;
//! use tidelog::{LogConfig, ReadMarker, StandardLogManager};
//! use tidelog_common::store::in_memory::InMemoryStoreManager;
//!
//! let manager = StandardLogManager::new(Arc::new(InMemoryStoreManager::new()), "node-1");
//! let log = manager
//!     .open_log("events", ReadMarker::with_identifier("billing", 0), LogConfig::default())
//!     .await?;
//!
//! // Produce; the future resolves once the message is flushed.
//! let delivery = log.produce(Bytes::from_static(b"hello")).await?;
//! delivery.wait().await?;
//!
//! // Consume.
//! log.register_reader(my_reader).await?;
//! ```

mod backend;
mod config;
mod error;
mod future;
mod log;
mod manager;
mod model;
mod puller;
mod send;
mod serde;
mod settings;

pub use config::LogConfig;
pub use error::{Error, Result};
pub use future::DeliveryFuture;
pub use log::Log;
pub use manager::{LogManager, StandardLogManager};
pub use model::{Message, MessageReader, ReadMarker};
