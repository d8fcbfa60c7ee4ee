//! Adapter entry point
//!
//! Wires a storage area, a key selection and the liveness flag into a
//! `StoreGroup`:
//!
//! 1. Stores are created (fixed keys) or served on demand (all keys).
//! 2. The initial bulk read is deferred to the scheduler; `ready` resolves
//!    once every value it returned is in its store.
//! 3. When live, a listener task applies change events from the area's own
//!    feed, or from the namespace feed filtered by the area's name.
//!
//! Configuration errors are returned by `StorageAdapter::open` right away.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::broadcast::{
    self,
    error::{RecvError, TryRecvError},
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, KeySelection};
use crate::fixed::FixedStores;
use crate::registry::DynamicRegistry;
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::sink::{Batch, SetErrorCallback, UpstreamSink, WriteHandle, WriteSubscription};
use crate::storage::{
    settle, ChangeEvent, KeySelector, StorageArea, StorageError, StorageNamespace,
};
use crate::store::Store;

/// Setup errors; they indicate misconfiguration, not transient failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// No area with this name in the namespace (or no namespace given)
    UnknownArea(String),
    /// Live updates were requested but the area has no change feed
    LiveUnsupported,
    /// A tokio runtime is needed but the caller is not running in one
    NoRuntime,
}

impl std::fmt::Display for AdapterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownArea(name) => write!(f, "Unknown storage area: {name}"),
            Self::LiveUnsupported => write!(f, "This area doesn't support live updates"),
            Self::NoRuntime => write!(f, "No tokio runtime to run the store group on"),
        }
    }
}

impl std::error::Error for AdapterError {}

/// Stores of a group: a frozen fixed-key mapping or a dynamic registry
#[derive(Debug)]
pub enum Stores {
    Fixed(FixedStores),
    Dynamic(DynamicRegistry),
}

impl Stores {
    /// Store for `key`
    ///
    /// Fixed: `None` for undeclared keys. Dynamic: always a store, created on
    /// first access.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Store> {
        match self {
            Self::Fixed(fixed) => fixed.get(key).cloned(),
            Self::Dynamic(registry) => Some(registry.resolve(key)),
        }
    }

    /// Fixed: the declared keys. Dynamic: keys with a confirmed value.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::Fixed(fixed) => fixed.keys().to_vec(),
            Self::Dynamic(registry) => registry.keys(),
        }
    }

    /// Whether `key` is among `keys()`; never creates a store
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        match self {
            Self::Fixed(fixed) => fixed.contains(key),
            Self::Dynamic(registry) => registry.is_filled(key),
        }
    }

    #[must_use]
    pub fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic(_))
    }

    #[must_use]
    pub fn as_fixed(&self) -> Option<&FixedStores> {
        match self {
            Self::Fixed(fixed) => Some(fixed),
            Self::Dynamic(_) => None,
        }
    }

    #[must_use]
    pub fn as_dynamic(&self) -> Option<&DynamicRegistry> {
        match self {
            Self::Fixed(_) => None,
            Self::Dynamic(registry) => Some(registry),
        }
    }

    /// Whether changes to `key` concern this group
    fn is_relevant(&self, key: &str) -> bool {
        match self {
            Self::Fixed(fixed) => fixed.contains(key),
            Self::Dynamic(_) => true,
        }
    }

    fn apply_upstream(&self, key: &str, value: Option<Value>) {
        match self {
            Self::Fixed(fixed) => fixed.apply_upstream(key, value),
            Self::Dynamic(registry) => registry.apply_upstream(key, value),
        }
    }
}

/// Completion of the initial bulk read
///
/// Clonable; resolves to `Ok(true)` once every value read is in its store,
/// or to the backend's error. Not retried.
#[derive(Clone)]
pub struct Ready {
    inner: Shared<BoxFuture<'static, Result<bool, StorageError>>>,
}

impl Ready {
    fn new(rx: oneshot::Receiver<Result<bool, StorageError>>) -> Self {
        let inner = rx
            .map(|received| received.unwrap_or(Err(StorageError::Disconnected)))
            .boxed()
            .shared();
        Self { inner }
    }

    /// Outcome of the initial read, if it has finished
    #[must_use]
    pub fn peek(&self) -> Option<Result<bool, StorageError>> {
        self.inner.peek().cloned()
    }
}

impl Future for Ready {
    type Output = Result<bool, StorageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl std::fmt::Debug for Ready {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ready").field("result", &self.peek()).finish()
    }
}

enum AreaSource {
    Area(Arc<dyn StorageArea>),
    Named(String),
}

/// Builder for a `StoreGroup`
pub struct StorageAdapter {
    source: AreaSource,
    namespace: Option<Arc<StorageNamespace>>,
    live: bool,
    on_set_error: Option<SetErrorCallback>,
    scheduler: Option<Arc<dyn Scheduler>>,
}

impl StorageAdapter {
    /// Use the given area
    #[must_use]
    pub fn new(area: Arc<dyn StorageArea>) -> Self {
        Self::with_source(AreaSource::Area(area), None)
    }

    /// Use the area registered as `name` in `namespace`
    #[must_use]
    pub fn named(namespace: Arc<StorageNamespace>, name: &str) -> Self {
        Self::with_source(AreaSource::Named(name.to_string()), Some(namespace))
    }

    /// Take area name and liveness from a configuration
    ///
    /// The configured keys are passed to `open` by the caller.
    #[must_use]
    pub fn from_config(namespace: Arc<StorageNamespace>, config: &AdapterConfig) -> Self {
        Self::named(namespace, &config.area).live(config.live)
    }

    fn with_source(source: AreaSource, namespace: Option<Arc<StorageNamespace>>) -> Self {
        Self {
            source,
            namespace,
            live: true,
            on_set_error: None,
            scheduler: None,
        }
    }

    /// Namespace whose feed serves areas without a feed of their own
    #[must_use]
    pub fn namespace(mut self, namespace: Arc<StorageNamespace>) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Whether stores follow changes made elsewhere (default: true)
    #[must_use]
    pub fn live(mut self, live: bool) -> Self {
        self.live = live;
        self
    }

    /// Called when a write fails (fixed keys only)
    ///
    /// Without it, fixed-key groups log failed writes.
    #[must_use]
    pub fn on_set_error<F>(mut self, on_set_error: F) -> Self
    where
        F: Fn(&StorageError, &Batch) + Send + Sync + 'static,
    {
        self.on_set_error = Some(Arc::new(on_set_error));
        self
    }

    /// Scheduler for write batching and the initial read
    ///
    /// Defaults to the current tokio runtime.
    #[must_use]
    pub fn scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Create the store group
    ///
    /// # Errors
    /// - `UnknownArea` if a named area does not exist
    /// - `LiveUnsupported` if live updates are requested and neither the
    ///   area nor its namespace provides a change feed for it
    /// - `NoRuntime` if a tokio runtime is needed and there is none
    pub fn open(self, keys: impl Into<KeySelection>) -> Result<StoreGroup, AdapterError> {
        let keys = keys.into();
        let area = match &self.source {
            AreaSource::Area(area) => Arc::clone(area),
            AreaSource::Named(name) => self
                .namespace
                .as_ref()
                .and_then(|namespace| namespace.area(name))
                .ok_or_else(|| AdapterError::UnknownArea(name.clone()))?,
        };

        let feed = if self.live {
            Some(change_feed(&area, self.namespace.as_deref())?)
        } else {
            None
        };

        let runtime = tokio::runtime::Handle::try_current().ok();
        let scheduler: Arc<dyn Scheduler> = match (self.scheduler, &runtime) {
            (Some(scheduler), _) => scheduler,
            (None, Some(handle)) => Arc::new(TokioScheduler::new(handle.clone())),
            (None, None) => return Err(AdapterError::NoRuntime),
        };
        if feed.is_some() && runtime.is_none() {
            return Err(AdapterError::NoRuntime);
        }

        let mut sink = UpstreamSink::for_area(Arc::clone(&area), Arc::clone(&scheduler));
        let (stores, sink) = match keys.declared() {
            Some(declared) => {
                sink = sink.with_error_callback(
                    self.on_set_error.unwrap_or_else(log_set_error),
                );
                let sink = Arc::new(sink);
                let fixed = FixedStores::new(&declared.keys, declared.defaults, &sink);
                (Stores::Fixed(fixed), sink)
            }
            None => {
                if self.on_set_error.is_some() {
                    warn!("on_set_error is ignored for dynamic store groups, use on_write");
                }
                let sink = Arc::new(sink);
                (Stores::Dynamic(DynamicRegistry::new(Arc::clone(&sink))), sink)
            }
        };
        let stores = Arc::new(stores);

        let (ready_tx, ready_rx) = oneshot::channel();
        let selector = keys.selector();
        let load_stores = Arc::clone(&stores);
        let load_area = Arc::clone(&area);
        let load_selector = selector.clone();
        scheduler.defer(
            async move {
                let result = load(load_area, load_selector, load_stores).await;
                // Nobody waiting for readiness is fine
                let _ = ready_tx.send(result);
            }
            .boxed(),
        );

        let listener = match (feed, runtime) {
            (Some((rx, area_name)), Some(handle)) => {
                let source = FeedSource {
                    area_name,
                    area,
                    selector,
                };
                Some(handle.spawn(listen(rx, source, Arc::clone(&stores))))
            }
            _ => None,
        };

        info!(
            dynamic = stores.is_dynamic(),
            live = listener.is_some(),
            "store group opened"
        );

        Ok(StoreGroup {
            stores,
            ready: Ready::new(ready_rx),
            sink,
            listener: Mutex::new(listener),
        })
    }
}

/// Find the change feed serving `area`
fn change_feed(
    area: &Arc<dyn StorageArea>,
    namespace: Option<&StorageNamespace>,
) -> Result<(broadcast::Receiver<ChangeEvent>, Option<String>), AdapterError> {
    if let Some(rx) = area.on_changed() {
        return Ok((rx, None));
    }
    let namespace = namespace.ok_or(AdapterError::LiveUnsupported)?;
    let name = namespace
        .name_of(area)
        .ok_or(AdapterError::LiveUnsupported)?;
    Ok((namespace.on_changed(), Some(name.to_string())))
}

fn log_set_error() -> SetErrorCallback {
    Arc::new(|e: &StorageError, batch: &Batch| {
        error!(error = %e, ?batch, "writing to storage failed");
    })
}

/// Initial bulk read: apply every value found, then report readiness
async fn load(
    area: Arc<dyn StorageArea>,
    selector: KeySelector,
    stores: Arc<Stores>,
) -> Result<bool, StorageError> {
    let result = area.get(&selector).await;
    let items = match settle(result, area.as_ref()) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "initial read failed");
            return Err(e);
        }
    };
    debug!(count = items.len(), "initial read complete");
    for (key, value) in items {
        stores.apply_upstream(&key, Some(value));
    }
    Ok(true)
}

/// What a listener needs besides the feed itself
struct FeedSource {
    /// Set for namespace-wide feeds, whose events are filtered by area name
    area_name: Option<String>,
    area: Arc<dyn StorageArea>,
    selector: KeySelector,
}

/// Apply change events until the feed closes or the task is aborted
///
/// Events lost to a lagging receiver are recovered by re-reading the area.
async fn listen(mut rx: broadcast::Receiver<ChangeEvent>, source: FeedSource, stores: Arc<Stores>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(name) = &source.area_name {
                    if event.area.as_deref() != Some(name.as_str()) {
                        continue;
                    }
                }
                for (key, change) in event.changes {
                    if stores.is_relevant(&key) {
                        stores.apply_upstream(&key, change.new_value);
                    }
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "change feed lagged, re-reading the area");
                // Retained events predate the re-read and are covered by it
                let closed = loop {
                    match rx.try_recv() {
                        Ok(_) | Err(TryRecvError::Lagged(_)) => {}
                        Err(TryRecvError::Empty) => break false,
                        Err(TryRecvError::Closed) => break true,
                    }
                };
                resync(&source, &stores).await;
                if closed {
                    debug!("change feed closed");
                    break;
                }
            }
            Err(RecvError::Closed) => {
                debug!("change feed closed");
                break;
            }
        }
    }
}

/// Bring every store in line with the area's current content
///
/// Keys the group knows about but the area no longer has are applied as
/// removed: fixed stores fall back to their default, dynamic ones are
/// dropped from enumeration.
async fn resync(source: &FeedSource, stores: &Stores) {
    let result = source.area.get(&source.selector).await;
    let items = match settle(result, source.area.as_ref()) {
        Ok(items) => items,
        Err(e) => {
            warn!(error = %e, "re-reading the area failed, stores may be stale");
            return;
        }
    };
    debug!(count = items.len(), "area re-read after lag");

    for key in stores.keys() {
        if !items.contains_key(&key) {
            stores.apply_upstream(&key, None);
        }
    }
    for (key, value) in items {
        if stores.is_relevant(&key) {
            stores.apply_upstream(&key, Some(value));
        }
    }
}

/// Stores plus the state shared by all of them
///
/// Dropping the group stops live updates.
pub struct StoreGroup {
    stores: Arc<Stores>,
    ready: Ready,
    sink: Arc<UpstreamSink>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl StoreGroup {
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Shorthand for `stores().get(key)`
    #[must_use]
    pub fn store(&self, key: &str) -> Option<Store> {
        self.stores.get(key)
    }

    /// Completion of the initial read
    #[must_use]
    pub fn ready(&self) -> Ready {
        self.ready.clone()
    }

    /// Register a callback invoked once per flushed batch
    ///
    /// It receives the pending completion of the write and the batch. The
    /// callback stays registered until the returned subscription is dropped
    /// or unsubscribed.
    pub fn on_write<F>(&self, observer: F) -> WriteSubscription
    where
        F: Fn(WriteHandle, &Batch) + Send + Sync + 'static,
    {
        self.sink.observe(observer)
    }

    /// Stop applying changes made elsewhere
    ///
    /// Writes already in flight are not affected. Calling it again, or on a
    /// group that was never live, does nothing.
    pub fn un_live(&self) {
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
            info!("live updates stopped");
        }
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.listener.lock().is_some()
    }
}

impl Drop for StoreGroup {
    fn drop(&mut self) {
        self.un_live();
    }
}

impl std::fmt::Debug for StoreGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreGroup")
            .field("stores", &self.stores)
            .field("ready", &self.ready)
            .field("live", &self.is_live())
            .finish_non_exhaustive()
    }
}
