//! Upstream sink: coalesces per-tick writes into one storage request
//!
//! The first `enqueue` of a tick opens a pending batch and defers a flush to
//! the scheduler. Later enqueues in the same tick merge into that batch, the
//! last value per key wins. The flush takes the batch by value before it
//! awaits anything, so writes made while a request is in flight start a new
//! batch and are flushed in a later tick.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use crate::scheduler::Scheduler;
use crate::storage::{settle, Items, StorageArea, StorageError};

/// Writes of one tick, merged by key
pub type Batch = Items;

/// Issues one storage write for a batch
pub type BatchWriter =
    Arc<dyn Fn(Batch) -> BoxFuture<'static, Result<(), StorageError>> + Send + Sync>;

/// Called once per flushed batch with the pending completion and the batch
pub type WriteObserver = Arc<dyn Fn(WriteHandle, &Batch) + Send + Sync>;

/// Called when a flushed batch fails
pub type SetErrorCallback = Arc<dyn Fn(&StorageError, &Batch) + Send + Sync>;

/// Completion of one flushed batch
///
/// Clonable; every clone resolves to the backend's result.
#[derive(Clone)]
pub struct WriteHandle {
    inner: Shared<BoxFuture<'static, Result<(), StorageError>>>,
}

impl WriteHandle {
    /// Result of the write, if it has completed
    #[must_use]
    pub fn peek(&self) -> Option<Result<(), StorageError>> {
        self.inner.peek().cloned()
    }
}

impl Future for WriteHandle {
    type Output = Result<(), StorageError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.inner).poll(cx)
    }
}

impl std::fmt::Debug for WriteHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteHandle")
            .field("result", &self.peek())
            .finish()
    }
}

struct SinkState {
    /// Writes waiting for the next flush
    pending: Option<Batch>,
    /// A flush task is deferred and has not started yet
    flush_scheduled: bool,
    observers: Vec<(u64, WriteObserver)>,
    next_observer_id: u64,
}

/// Batches store writes and sends them to storage once per tick
pub struct UpstreamSink {
    state: Mutex<SinkState>,
    writer: BatchWriter,
    scheduler: Arc<dyn Scheduler>,
    on_error: Option<SetErrorCallback>,
}

impl UpstreamSink {
    /// Create a sink flushing through `writer`
    #[must_use]
    pub fn new(writer: BatchWriter, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            state: Mutex::new(SinkState {
                pending: None,
                flush_scheduled: false,
                observers: Vec::new(),
                next_observer_id: 0,
            }),
            writer,
            scheduler,
            on_error: None,
        }
    }

    /// Create a sink flushing into `area`
    ///
    /// The area's last-error slot is checked after every write.
    #[must_use]
    pub fn for_area(area: Arc<dyn StorageArea>, scheduler: Arc<dyn Scheduler>) -> Self {
        let writer: BatchWriter = Arc::new(move |batch: Batch| {
            let area = Arc::clone(&area);
            async move {
                let result = area.set(batch).await;
                settle(result, area.as_ref())
            }
            .boxed()
        });
        Self::new(writer, scheduler)
    }

    /// Report failed flushes to `on_error` in addition to write observers
    #[must_use]
    pub fn with_error_callback(mut self, on_error: SetErrorCallback) -> Self {
        self.on_error = Some(on_error);
        self
    }

    /// Queue a write for the current tick
    pub fn enqueue(self: &Arc<Self>, key: &str, value: Value) {
        let mut state = self.state.lock();
        state
            .pending
            .get_or_insert_with(Batch::new)
            .insert(key.to_string(), value);
        let first_in_tick = !std::mem::replace(&mut state.flush_scheduled, true);
        drop(state);

        if first_in_tick {
            let mut guard = ScheduledFlush {
                sink: Arc::clone(self),
                armed: true,
            };
            self.scheduler.defer(
                async move {
                    guard.armed = false;
                    Arc::clone(&guard.sink).flush().await;
                }
                .boxed(),
            );
        }
    }

    /// Whether writes are waiting for the next flush
    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Register a write observer
    ///
    /// The observer stays registered until the returned subscription is
    /// dropped or unsubscribed.
    pub fn observe<F>(self: &Arc<Self>, observer: F) -> WriteSubscription
    where
        F: Fn(WriteHandle, &Batch) + Send + Sync + 'static,
    {
        let mut state = self.state.lock();
        let id = state.next_observer_id;
        state.next_observer_id += 1;
        state.observers.push((id, Arc::new(observer)));
        WriteSubscription {
            sink: Arc::downgrade(self),
            id,
        }
    }

    fn unobserve(&self, id: u64) {
        let mut state = self.state.lock();
        let before = state.observers.len();
        state.observers.retain(|(observer_id, _)| *observer_id != id);
        if state.observers.len() == before {
            log::warn!("sink.unobserve: observer {id} not registered");
        }
    }

    async fn flush(self: Arc<Self>) {
        let (batch, observers) = {
            let mut state = self.state.lock();
            state.flush_scheduled = false;
            let Some(batch) = state.pending.take() else {
                return;
            };
            let observers: Vec<WriteObserver> = state
                .observers
                .iter()
                .map(|(_, observer)| Arc::clone(observer))
                .collect();
            (batch, observers)
        };

        log::debug!(
            "sink.flush: {} key(s), {} observer(s)",
            batch.len(),
            observers.len()
        );

        let handle = WriteHandle {
            inner: (self.writer)(batch.clone()).shared(),
        };
        for observer in observers {
            observer(handle.clone(), &batch);
        }

        if let Err(e) = handle.await {
            log::debug!("sink.flush: write failed: {e}");
            if let Some(on_error) = &self.on_error {
                on_error(&e, &batch);
            }
        }
    }
}

/// Deferred flush that never ran
///
/// A scheduler may drop a task without running it, e.g. on runtime
/// shutdown. The writes stay pending and the next enqueue schedules again.
struct ScheduledFlush {
    sink: Arc<UpstreamSink>,
    armed: bool,
}

impl Drop for ScheduledFlush {
    fn drop(&mut self) {
        if self.armed {
            self.sink.state.lock().flush_scheduled = false;
            log::debug!("sink.flush: deferred flush dropped before running");
        }
    }
}

/// Registration of a write observer
///
/// Dropping it unregisters the observer.
#[must_use = "dropping the subscription unregisters the observer"]
pub struct WriteSubscription {
    sink: Weak<UpstreamSink>,
    id: u64,
}

impl WriteSubscription {
    /// Unregister the observer
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for WriteSubscription {
    fn drop(&mut self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.unobserve(self.id);
        }
    }
}
