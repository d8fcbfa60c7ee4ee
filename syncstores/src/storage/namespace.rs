//! Default backend namespace: named storage areas sharing one change feed

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::memory::MemStorage;
use super::types::{ChangeEvent, StorageArea, CHANGE_FEED_CAPACITY};

/// Names of the areas created by `StorageNamespace::in_memory`
pub const DEFAULT_AREAS: [&str; 3] = ["sync", "local", "session"];

/// A set of named storage areas plus a namespace-wide change feed
///
/// Events on the namespace feed carry the name of the area they come from.
/// Areas without a feed of their own report here.
pub struct StorageNamespace {
    areas: BTreeMap<String, Arc<dyn StorageArea>>,
    on_changed: broadcast::Sender<ChangeEvent>,
}

impl StorageNamespace {
    /// Create a namespace with no areas
    #[must_use]
    pub fn new() -> Self {
        let (on_changed, _rx) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            areas: BTreeMap::new(),
            on_changed,
        }
    }

    /// Create a namespace with the default in-memory areas attached
    #[must_use]
    pub fn in_memory() -> Self {
        let mut namespace = Self::new();
        for name in DEFAULT_AREAS {
            namespace.add_memory_area(name);
        }
        namespace
    }

    /// Register an area under `name`, replacing any previous one
    pub fn insert(&mut self, name: &str, area: Arc<dyn StorageArea>) {
        if self.areas.insert(name.to_string(), area).is_some() {
            log::warn!("namespace.insert: area '{name}' replaced");
        }
    }

    /// Create a `MemStorage` attached to this namespace's feed and register it
    pub fn add_memory_area(&mut self, name: &str) -> Arc<MemStorage> {
        let area = Arc::new(MemStorage::attached(name, self.on_changed.clone()));
        self.insert(name, Arc::clone(&area) as Arc<dyn StorageArea>);
        area
    }

    /// Look up an area by name
    #[must_use]
    pub fn area(&self, name: &str) -> Option<Arc<dyn StorageArea>> {
        self.areas.get(name).cloned()
    }

    /// Find the name an area is registered under, by identity
    #[must_use]
    pub fn name_of(&self, area: &Arc<dyn StorageArea>) -> Option<&str> {
        self.areas
            .iter()
            .find(|(_, candidate)| std::ptr::addr_eq(Arc::as_ptr(candidate), Arc::as_ptr(area)))
            .map(|(name, _)| name.as_str())
    }

    /// Names of all registered areas, in order
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.areas.keys().map(String::as_str)
    }

    /// Subscribe to the namespace-wide change feed
    #[must_use]
    pub fn on_changed(&self) -> broadcast::Receiver<ChangeEvent> {
        self.on_changed.subscribe()
    }

    /// Sender side of the namespace feed, for attaching custom areas
    #[must_use]
    pub fn sender(&self) -> broadcast::Sender<ChangeEvent> {
        self.on_changed.clone()
    }
}

impl Default for StorageNamespace {
    fn default() -> Self {
        Self::new()
    }
}
