//! Dynamic store registry
//!
//! Serves a store for any key, creating it on first access. A key can be in
//! one of three states:
//!
//! - *filled*: the store holds a confirmed value. The registry keeps a strong
//!   handle, so the store survives with no outside references.
//! - *observed*: no confirmed value, but someone subscribes. Subscriptions
//!   hold strong handles, which keeps the store alive.
//! - *unfilled*: neither. The registry only keeps a weak handle, and the store
//!   goes away with its last outside reference.
//!
//! While a store is alive, every `resolve` of its key returns it. When it is
//! destroyed, its destructor posts the key on the reclaim channel, and the
//! registry forgets the dead weak handle the next time it is accessed. A dead
//! handle that has not been pruned yet reads as "no store".

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;

use crate::sink::UpstreamSink;
use crate::store::{FillTracker, Origin, Store, WeakStore};

/// Population state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Population {
    /// No live store, or a live store with no value and no subscribers
    Unfilled,
    /// A live store with subscribers but no confirmed value
    Observed,
    /// A store with a confirmed value
    Filled,
}

struct RegistryState {
    filled: BTreeMap<String, Store>,
    tracked: HashMap<String, WeakStore>,
    reclaimed: mpsc::UnboundedReceiver<String>,
}

impl RegistryState {
    /// Forget weak handles whose stores were destroyed
    fn prune(&mut self) {
        while let Ok(key) = self.reclaimed.try_recv() {
            // A newer store may have been created for the same key
            if self.tracked.get(&key).is_some_and(WeakStore::is_dead) {
                self.tracked.remove(&key);
                log::debug!("registry.prune: forgot '{key}'");
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<Store> {
        self.filled
            .get(key)
            .cloned()
            .or_else(|| self.tracked.get(key).and_then(WeakStore::upgrade))
    }
}

struct Tracker {
    state: Weak<Mutex<RegistryState>>,
    reclaim_tx: mpsc::UnboundedSender<String>,
}

impl FillTracker for Tracker {
    fn filled(&self, store: &Store) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let mut state = state.lock();
        let previous = state
            .filled
            .insert(store.key().to_string(), store.clone());
        drop(state);

        if let Some(previous) = previous {
            if !Store::ptr_eq(&previous, store) {
                log::warn!(
                    "registry.filled: '{}' replaced a different filled store",
                    store.key()
                );
            }
        }
    }

    fn reclaimed(&self, key: &str) {
        // Fails only once the registry is gone, then there is nothing to prune
        let _ = self.reclaim_tx.send(key.to_string());
    }
}

/// Lazily populated, key-indexed collection of stores
pub struct DynamicRegistry {
    state: Arc<Mutex<RegistryState>>,
    tracker: Arc<Tracker>,
    sink: Arc<UpstreamSink>,
}

impl DynamicRegistry {
    /// Create an empty registry whose stores write through `sink`
    #[must_use]
    pub fn new(sink: Arc<UpstreamSink>) -> Self {
        let (reclaim_tx, reclaimed) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(RegistryState {
            filled: BTreeMap::new(),
            tracked: HashMap::new(),
            reclaimed,
        }));
        let tracker = Arc::new(Tracker {
            state: Arc::downgrade(&state),
            reclaim_tx,
        });
        Self {
            state,
            tracker,
            sink,
        }
    }

    /// Get the store for `key`, creating it if no live one exists
    #[must_use]
    pub fn resolve(&self, key: &str) -> Store {
        let mut state = self.state.lock();
        state.prune();
        if let Some(store) = state.lookup(key) {
            return store;
        }
        self.fabricate(&mut state, key)
    }

    fn fabricate(&self, state: &mut RegistryState, key: &str) -> Store {
        let tracker: Arc<dyn FillTracker> = self.tracker.clone();
        let store = Store::tracked(key, Arc::clone(&self.sink), tracker);
        state.tracked.insert(key.to_string(), store.downgrade());
        log::trace!("registry.fabricate: '{key}'");
        store
    }

    /// Apply a value reported by storage, `None` meaning "removed"
    ///
    /// Updates the live store for `key` without sending the value back
    /// upstream. A present value for a key without a store creates the
    /// store; a removal for such a key is dropped.
    pub fn apply_upstream(&self, key: &str, value: Option<Value>) {
        let (store, evicted) = {
            let mut state = self.state.lock();
            state.prune();
            match (state.lookup(key), value.is_some()) {
                (Some(store), true) => {
                    let previous = state.filled.insert(key.to_string(), store.clone());
                    (store, previous)
                }
                (Some(store), false) => {
                    let evicted = state.filled.remove(key);
                    (store, evicted)
                }
                (None, true) => {
                    let store = self.fabricate(&mut state, key);
                    state.filled.insert(key.to_string(), store.clone());
                    (store, None)
                }
                (None, false) => {
                    log::debug!("registry.apply_upstream: no store for removed '{key}'");
                    return;
                }
            }
        };
        // Released outside the lock, a last handle runs the store destructor
        drop(evicted);

        store.apply(value, Origin::Remote);
    }

    /// Keys whose stores hold a confirmed value, in key order
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let mut state = self.state.lock();
        state.prune();
        state.filled.keys().cloned().collect()
    }

    /// Whether `key` has a confirmed value
    #[must_use]
    pub fn is_filled(&self, key: &str) -> bool {
        self.state.lock().filled.contains_key(key)
    }

    /// Population state of `key`
    ///
    /// Never creates a store.
    #[must_use]
    pub fn population(&self, key: &str) -> Population {
        let mut state = self.state.lock();
        state.prune();
        if state.filled.contains_key(key) {
            return Population::Filled;
        }
        let observed = state
            .tracked
            .get(key)
            .and_then(WeakStore::upgrade)
            .is_some_and(|store| store.subscriber_count() > 0);
        if observed {
            Population::Observed
        } else {
            Population::Unfilled
        }
    }

    /// Number of keys with a live store
    #[must_use]
    pub fn tracked_len(&self) -> usize {
        let mut state = self.state.lock();
        state.prune();
        state.tracked.len()
    }
}

impl std::fmt::Debug for DynamicRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("DynamicRegistry")
            .field("filled", &state.filled.keys().collect::<Vec<_>>())
            .field("tracked", &state.tracked.len())
            .finish_non_exhaustive()
    }
}
