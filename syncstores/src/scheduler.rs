//! Deferred execution ("ticks")
//!
//! Work handed to a `Scheduler` runs after the current synchronous work
//! finishes. The upstream sink relies on this to coalesce all writes made in
//! one tick into a single storage request.

use futures::future::BoxFuture;
use parking_lot::Mutex;

/// Runs deferred tasks
pub trait Scheduler: Send + Sync {
    /// Run `task` once the current synchronous work is done
    fn defer(&self, task: BoxFuture<'static, ()>);
}

/// Scheduler backed by a tokio runtime
///
/// On a current-thread runtime a spawned task cannot start before the
/// spawning code yields, so everything done before the next `.await` lands
/// in the same tick. On a multi-thread runtime a tick may end earlier.
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler for the runtime the caller is running in, if any
    #[must_use]
    pub fn try_current() -> Option<Self> {
        tokio::runtime::Handle::try_current().ok().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn defer(&self, task: BoxFuture<'static, ()>) {
        // Detached: completion is reported by the task itself
        drop(self.handle.spawn(task));
    }
}

/// Scheduler that queues tasks until `run_pending` is called
///
/// Ticks are explicit, which makes batching deterministic without any
/// async runtime.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<BoxFuture<'static, ()>>>,
}

impl ManualScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks waiting for the next tick
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Run every task queued so far to completion, blocking the caller
    ///
    /// Tasks deferred while running belong to the next tick and stay queued.
    /// Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        let tasks = std::mem::take(&mut *self.queue.lock());
        let count = tasks.len();
        for task in tasks {
            futures::executor::block_on(task);
        }
        count
    }
}

impl Scheduler for ManualScheduler {
    fn defer(&self, task: BoxFuture<'static, ()>) {
        self.queue.lock().push(task);
    }
}
