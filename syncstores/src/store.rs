//! Observable value cell
//!
//! A `Store` holds the current value of one storage key and a list of
//! subscribers. Every update carries an `Origin`: local writes are forwarded
//! to the upstream sink, storage-origin updates are not. This is what keeps
//! a value echoed back by the storage area from being written again.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};

use crate::sink::UpstreamSink;

/// Where a value update comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Written by a caller; goes upstream
    Local,
    /// Reported by the storage area; stays local
    Remote,
}

/// Subscriber callback, `None` means "no value"
type Subscriber = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

/// Hooks for a store owned by the dynamic registry
pub(crate) trait FillTracker: Send + Sync {
    /// A local write gave `store` a confirmed value
    fn filled(&self, store: &Store);
    /// The store for `key` is being destroyed
    fn reclaimed(&self, key: &str);
}

struct StoreState {
    value: Option<Value>,
    subscribers: Vec<(u64, Subscriber)>,
    next_subscriber_id: u64,
}

pub(crate) struct StoreInner {
    key: String,
    state: Mutex<StoreState>,
    sink: Arc<UpstreamSink>,
    tracker: Option<Arc<dyn FillTracker>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if let Some(tracker) = &self.tracker {
            tracker.reclaimed(&self.key);
        }
    }
}

/// Observable value synchronized with one storage key
///
/// Cloning is cheap and yields the same store; compare with `Store::ptr_eq`.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub(crate) fn new(key: &str, initial: Option<Value>, sink: Arc<UpstreamSink>) -> Self {
        Self::build(key, initial, sink, None)
    }

    pub(crate) fn tracked(
        key: &str,
        sink: Arc<UpstreamSink>,
        tracker: Arc<dyn FillTracker>,
    ) -> Self {
        Self::build(key, None, sink, Some(tracker))
    }

    fn build(
        key: &str,
        initial: Option<Value>,
        sink: Arc<UpstreamSink>,
        tracker: Option<Arc<dyn FillTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                key: key.to_string(),
                state: Mutex::new(StoreState {
                    value: initial,
                    subscribers: Vec::new(),
                    next_subscriber_id: 0,
                }),
                sink,
                tracker,
            }),
        }
    }

    /// Storage key of this store
    #[must_use]
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Current value, `None` if there is none
    #[must_use]
    pub fn get(&self) -> Option<Value> {
        self.inner.state.lock().value.clone()
    }

    /// Set the value and send it upstream
    pub fn set(&self, value: Value) {
        self.apply(Some(value), Origin::Local);
    }

    /// Compute the new value from the current one and send it upstream
    ///
    /// `updater` runs under the store's lock, so concurrent updates are not
    /// lost. It must not access this store.
    pub fn update<F>(&self, updater: F)
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        self.replace(Origin::Local, |current| Some(updater(current)));
    }

    /// Subscribe to value changes
    ///
    /// The subscriber is called right away with the current value, then on
    /// every change. It stays attached, and keeps the store alive, until the
    /// returned subscription is dropped or unsubscribed.
    pub fn subscribe<F>(&self, subscriber: F) -> Subscription
    where
        F: Fn(Option<&Value>) + Send + Sync + 'static,
    {
        let subscriber: Subscriber = Arc::new(subscriber);
        let (id, current) = {
            let mut state = self.inner.state.lock();
            let id = state.next_subscriber_id;
            state.next_subscriber_id += 1;
            state.subscribers.push((id, Arc::clone(&subscriber)));
            (id, state.value.clone())
        };
        subscriber(current.as_ref());
        Subscription {
            store: self.clone(),
            id,
        }
    }

    /// Number of attached subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Whether two handles refer to the same store
    #[must_use]
    pub fn ptr_eq(a: &Store, b: &Store) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    /// Replace the value and notify subscribers if it changed
    ///
    /// Only `Origin::Local` values are forwarded to the upstream sink.
    pub(crate) fn apply(&self, value: Option<Value>, origin: Origin) {
        self.replace(origin, |_| value);
    }

    fn replace<F>(&self, origin: Origin, compute: F)
    where
        F: FnOnce(Option<&Value>) -> Option<Value>,
    {
        let (value, changed, subscribers) = {
            let mut state = self.inner.state.lock();
            let value = compute(state.value.as_ref());
            // Enqueued under the lock so the sink sees writes in store order
            if let (Origin::Local, Some(value)) = (origin, &value) {
                self.inner.sink.enqueue(&self.inner.key, value.clone());
            }
            let changed = state.value != value;
            state.value.clone_from(&value);
            let subscribers: Vec<Subscriber> = if changed {
                state
                    .subscribers
                    .iter()
                    .map(|(_, subscriber)| Arc::clone(subscriber))
                    .collect()
            } else {
                Vec::new()
            };
            (value, changed, subscribers)
        };

        if origin == Origin::Local && value.is_some() {
            if let Some(tracker) = &self.inner.tracker {
                tracker.filled(self);
            }
        }

        if changed {
            for subscriber in subscribers {
                subscriber(value.as_ref());
            }
        }
    }

    fn unsubscribe(&self, id: u64) {
        let mut state = self.inner.state.lock();
        state.subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Store")
            .field("key", &self.inner.key)
            .field("value", &state.value)
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

/// Handle that does not keep a store alive
#[derive(Clone)]
pub(crate) struct WeakStore(Weak<StoreInner>);

impl WeakStore {
    pub(crate) fn upgrade(&self) -> Option<Store> {
        self.0.upgrade().map(|inner| Store { inner })
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// An attached store subscriber
///
/// Dropping it detaches the subscriber.
#[must_use = "dropping the subscription detaches the subscriber"]
pub struct Subscription {
    store: Store,
    id: u64,
}

impl Subscription {
    /// The store this subscription is attached to
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Detach the subscriber
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.store.unsubscribe(self.id);
    }
}
