//! In-memory implementation of `StorageArea`

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tokio::sync::broadcast;

use super::types::{
    Change, ChangeEvent, Items, KeySelector, StorageArea, StorageError, CHANGE_FEED_CAPACITY,
};

/// Where change events of a `MemStorage` go
enum Feed {
    /// The area has its own feed
    Own(broadcast::Sender<ChangeEvent>),
    /// The area reports into a namespace-wide feed under its name
    Attached {
        name: String,
        sender: broadcast::Sender<ChangeEvent>,
    },
}

/// How an injected failure is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultChannel {
    /// Through the request's own result
    Result,
    /// Through the ambient last-error slot, the request itself succeeds
    LastError,
}

#[derive(Default)]
struct Faults {
    get: Option<(StorageError, FaultChannel)>,
    set: Option<(StorageError, FaultChannel)>,
}

/// In-memory storage area
///
/// Simple map based storage, useful for testing and single-process use.
/// Records every `set` batch and can be told to fail its next request.
pub struct MemStorage {
    items: Mutex<Items>,
    feed: Feed,
    last_error: Mutex<Option<StorageError>>,
    faults: Mutex<Faults>,
    writes: Mutex<Vec<Items>>,
}

impl MemStorage {
    /// Create an empty area with its own change feed
    #[must_use]
    pub fn new() -> Self {
        let (sender, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self::with_feed(Feed::Own(sender))
    }

    /// Create an empty area reporting into a namespace-wide feed
    #[must_use]
    pub fn attached(name: &str, sender: broadcast::Sender<ChangeEvent>) -> Self {
        Self::with_feed(Feed::Attached {
            name: name.to_string(),
            sender,
        })
    }

    fn with_feed(feed: Feed) -> Self {
        Self {
            items: Mutex::new(BTreeMap::new()),
            feed,
            last_error: Mutex::new(None),
            faults: Mutex::new(Faults::default()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Replace the stored items without emitting change events
    #[must_use]
    pub fn with_items(self, items: Items) -> Self {
        *self.items.lock() = items;
        self
    }

    /// Snapshot of the stored items
    #[must_use]
    pub fn items(&self) -> Items {
        self.items.lock().clone()
    }

    /// Every batch passed to `set`, in call order
    #[must_use]
    pub fn writes(&self) -> Vec<Items> {
        self.writes.lock().clone()
    }

    /// Make the next `get` fail with `error`
    pub fn fail_next_get(&self, error: StorageError, channel: FaultChannel) {
        self.faults.lock().get = Some((error, channel));
    }

    /// Make the next `set` fail with `error`
    ///
    /// A failed `set` stores nothing and emits no change event.
    pub fn fail_next_set(&self, error: StorageError, channel: FaultChannel) {
        self.faults.lock().set = Some((error, channel));
    }

    /// Check an injected fault. Returns `Err` if the request must fail
    /// through its result, `Ok(true)` if it must be skipped and reported
    /// through the last-error slot.
    fn fault(&self, fault: Option<(StorageError, FaultChannel)>) -> Result<bool, StorageError> {
        match fault {
            None => Ok(false),
            Some((error, FaultChannel::Result)) => Err(error),
            Some((error, FaultChannel::LastError)) => {
                *self.last_error.lock() = Some(error);
                Ok(true)
            }
        }
    }

    fn emit(&self, changes: BTreeMap<String, Change>) {
        if changes.is_empty() {
            return;
        }
        let (sender, area) = match &self.feed {
            Feed::Own(sender) => (sender, None),
            Feed::Attached { name, sender } => (sender, Some(name.clone())),
        };
        // No receivers is fine: nobody is live
        if sender.send(ChangeEvent { changes, area }).is_err() {
            log::trace!("memStorage.emit: no listeners");
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageArea for MemStorage {
    fn get<'a>(&'a self, keys: &'a KeySelector) -> BoxFuture<'a, Result<Items, StorageError>> {
        async move {
            let fault = self.faults.lock().get.take();
            if self.fault(fault)? {
                return Ok(Items::new());
            }

            let items = self.items.lock();
            Ok(items
                .iter()
                .filter(|(key, _)| keys.matches(key))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect())
        }
        .boxed()
    }

    fn set(&self, items: Items) -> BoxFuture<'_, Result<(), StorageError>> {
        async move {
            self.writes.lock().push(items.clone());
            let fault = self.faults.lock().set.take();
            if self.fault(fault)? {
                return Ok(());
            }

            let mut changes = BTreeMap::new();
            {
                let mut stored = self.items.lock();
                for (key, value) in items {
                    stored.insert(key.clone(), value.clone());
                    changes.insert(key, Change::set(value));
                }
            }
            self.emit(changes);
            Ok(())
        }
        .boxed()
    }

    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<(), StorageError>> {
        async move {
            let existed = self.items.lock().remove(key).is_some();
            if existed {
                self.emit(BTreeMap::from([(key.to_string(), Change::removed())]));
            }
            Ok(())
        }
        .boxed()
    }

    fn on_changed(&self) -> Option<broadcast::Receiver<ChangeEvent>> {
        match &self.feed {
            Feed::Own(sender) => Some(sender.subscribe()),
            Feed::Attached { .. } => None,
        }
    }

    fn take_last_error(&self) -> Option<StorageError> {
        self.last_error.lock().take()
    }
}
