//! Observable value stores kept in sync with a key/value storage area.
//!
//! Writes to a store are batched per tick and sent to the storage area;
//! changes reported by the area flow back into the same stores.
//!
//! ```no_run
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! use std::sync::Arc;
//! use serde_json::json;
//! use syncstores::{MemStorage, StorageAdapter};
//!
//! let area = Arc::new(MemStorage::new());
//! let group = StorageAdapter::new(area).open([("count", json!(0))])?;
//! group.ready().await?;
//!
//! let count = group.store("count").expect("declared key");
//! count.update(|n| json!(n.and_then(|v| v.as_i64()).unwrap_or(0) + 1));
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod config;
pub mod fixed;
pub mod registry;
pub mod scheduler;
pub mod sink;
pub mod storage;
pub mod store;

// Re-export adapter types for convenience
pub use adapter::{AdapterError, Ready, StorageAdapter, StoreGroup, Stores};

// Re-export configuration types
pub use config::{AdapterConfig, KeySelection};

// Re-export store types
pub use fixed::FixedStores;
pub use registry::{DynamicRegistry, Population};
pub use store::{Origin, Store, Subscription};

// Re-export batching types
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use sink::{Batch, UpstreamSink, WriteHandle, WriteSubscription};

// Re-export storage types
pub use storage::{
    Change, ChangeEvent, FaultChannel, Items, KeySelector, MemStorage, StorageArea,
    StorageError, StorageNamespace,
};
