//! Storage backend types and traits

use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

/// Key to value mapping, as read from or written to a storage area
pub type Items = BTreeMap<String, Value>;

/// Capacity of the broadcast channels carrying change events
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// Which keys a bulk read should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// A single key
    One(String),
    /// A list of keys
    Many(Vec<String>),
    /// The whole storage area
    All,
}

impl KeySelector {
    /// Whether `key` is selected
    #[must_use]
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::One(one) => one == key,
            Self::Many(keys) => keys.iter().any(|k| k == key),
            Self::All => true,
        }
    }
}

/// Change of one key, as delivered by a change feed
///
/// `new_value` is `None` when the key was removed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Change {
    pub new_value: Option<Value>,
}

impl Change {
    #[must_use]
    pub fn set(value: Value) -> Self {
        Self {
            new_value: Some(value),
        }
    }

    #[must_use]
    pub fn removed() -> Self {
        Self { new_value: None }
    }
}

/// One notification from a change feed
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChangeEvent {
    pub changes: BTreeMap<String, Change>,
    /// Name of the area the change happened in, for namespace-wide feeds
    pub area: Option<String>,
}

/// Errors reported by a storage area
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend rejected or failed the request
    Backend(String),
    /// The request was dropped before it completed
    Disconnected,
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Backend(msg) => write!(f, "Storage error: {msg}"),
            Self::Disconnected => write!(f, "Storage request dropped before completion"),
        }
    }
}

impl std::error::Error for StorageError {}

/// Trait for key/value storage areas
///
/// Requests are asynchronous; a value is any JSON value. Futures are boxed so
/// that areas can be selected at runtime and shared as `Arc<dyn StorageArea>`.
pub trait StorageArea: Send + Sync {
    /// Read the selected keys. Keys that are not stored are omitted.
    fn get<'a>(&'a self, keys: &'a KeySelector) -> BoxFuture<'a, Result<Items, StorageError>>;

    /// Write all items in one request.
    fn set(&self, items: Items) -> BoxFuture<'_, Result<(), StorageError>>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>>;

    /// Subscribe to this area's own change feed.
    ///
    /// Returns `None` if the area only reports changes through the feed of
    /// the namespace it belongs to.
    fn on_changed(&self) -> Option<broadcast::Receiver<ChangeEvent>>;

    /// Take the error left in the ambient "last error" slot, if any.
    ///
    /// Checked right after every request completes.
    fn take_last_error(&self) -> Option<StorageError> {
        None
    }
}

/// Fold the area's last-error slot into the result of a completed request
///
/// An error from either source fails the request; the returned error wins
/// over the slot, and the slot is cleared in both cases.
pub fn settle<T>(
    result: Result<T, StorageError>,
    area: &dyn StorageArea,
) -> Result<T, StorageError> {
    let last_error = area.take_last_error();
    match (result, last_error) {
        (Err(e), _) | (Ok(_), Some(e)) => Err(e),
        (Ok(value), None) => Ok(value),
    }
}
