//! Storage layer for syncstores
//!
//! Contains the storage backend contract and the in-process backends.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  StoreGroup (adapter)               │
//! │  - initial bulk read                │
//! │  - live change listener             │
//! └─────────────────────────────────────┘
//!          ▲                    │
//!          │ ChangeEvent feed   │ get / set via UpstreamSink
//!          │                    ▼
//! ┌─────────────────────────────────────┐
//! │  StorageArea (backend contract)     │
//! │  - async get / set / remove         │
//! │  - optional own change feed         │
//! │  - ambient last-error slot          │
//! └─────────────────────────────────────┘
//!      ▲              ▲             ▲
//!      │              │             │
//!  MemStorage   StorageNamespace   SqliteStorage (cli)
//!               (named areas +
//!                shared feed)
//! ```

pub mod memory;
pub mod namespace;
pub mod types;

pub use memory::{FaultChannel, MemStorage};
pub use namespace::StorageNamespace;
pub use types::{
    settle, Change, ChangeEvent, Items, KeySelector, StorageArea, StorageError,
    CHANGE_FEED_CAPACITY,
};
