//! Fixed-key store group
//!
//! All keys are known upfront. Stores are created eagerly and start at their
//! default value; a key removed from storage falls back to its default.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::sink::UpstreamSink;
use crate::store::{Origin, Store};

/// Frozen mapping from declared keys to stores
pub struct FixedStores {
    stores: BTreeMap<String, Store>,
    /// Position of each key in declaration order
    order: Vec<String>,
    defaults: BTreeMap<String, Value>,
}

impl FixedStores {
    /// Create one store per key, starting at its default (if any)
    #[must_use]
    pub fn new(keys: &[String], defaults: BTreeMap<String, Value>, sink: &Arc<UpstreamSink>) -> Self {
        let mut stores = BTreeMap::new();
        let mut order = Vec::with_capacity(keys.len());
        for key in keys {
            if stores.contains_key(key) {
                continue;
            }
            let store = Store::new(key, defaults.get(key).cloned(), Arc::clone(sink));
            stores.insert(key.clone(), store);
            order.push(key.clone());
        }
        Self {
            stores,
            order,
            defaults,
        }
    }

    /// Store for a declared key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Store> {
        self.stores.get(key)
    }

    /// Whether `key` was declared
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.stores.contains_key(key)
    }

    /// Declared keys, in declaration order
    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.order
    }

    /// Default value of a declared key
    #[must_use]
    pub fn default_for(&self, key: &str) -> Option<&Value> {
        self.defaults.get(key)
    }

    /// Stores in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Store)> + '_ {
        self.order
            .iter()
            .filter_map(|key| self.stores.get(key).map(|store| (key.as_str(), store)))
    }

    /// Apply a value reported by storage, `None` restoring the default
    ///
    /// Undeclared keys are ignored.
    pub fn apply_upstream(&self, key: &str, value: Option<Value>) {
        let Some(store) = self.stores.get(key) else {
            return;
        };
        let value = value.or_else(|| self.defaults.get(key).cloned());
        store.apply(value, Origin::Remote);
    }
}

impl std::fmt::Debug for FixedStores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedStores")
            .field("keys", &self.order)
            .field("defaults", &self.defaults)
            .finish_non_exhaustive()
    }
}
