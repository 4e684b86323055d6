//! Per-worker state
//!
//! Each consumer thread owns one [`WorkerContext`]. While a task step runs,
//! the context is installed in a thread local of whichever thread executes
//! task code: the worker itself, or the coroutine the worker resumed. The
//! coroutine baton carries it between the two.

use std::cell::RefCell;
use std::sync::Arc;

use crossbeam_deque::Worker as LocalQueue;

use crate::coro::LocalCoroutineCache;
use crate::task::TaskContext;

/// State owned by one consumer of a task processor
pub(crate) struct WorkerContext {
    /// Id of the owning processor
    pub(crate) processor_id: u64,
    /// Consumer index within the processor
    pub(crate) index: usize,
    /// Local run queue, present for work-stealing processors
    pub(crate) local: Option<LocalQueue<Arc<TaskContext>>>,
    /// Idle coroutines reused without touching the shared pool
    pub(crate) coroutines: LocalCoroutineCache,
    /// Pop attempts, used to interleave global queue checks
    pub(crate) pops: u64,
}

impl WorkerContext {
    pub(crate) fn new(
        processor_id: u64,
        index: usize,
        local: Option<LocalQueue<Arc<TaskContext>>>,
    ) -> Self {
        Self {
            processor_id,
            index,
            local,
            coroutines: LocalCoroutineCache::new(),
            pops: 0,
        }
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("processor_id", &self.processor_id)
            .field("index", &self.index)
            .field("cached_coroutines", &self.coroutines.len())
            .finish()
    }
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<Box<WorkerContext>>> = const { RefCell::new(None) };
    static IS_WORKER_THREAD: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// Install the worker state on the calling thread
pub(crate) fn install(worker: Option<Box<WorkerContext>>) {
    CURRENT_WORKER.with(|current| {
        let previous = current.replace(worker);
        uassert!(previous.is_none(), "worker state installed twice");
    });
}

/// Take the worker state off the calling thread
pub(crate) fn uninstall() -> Option<Box<WorkerContext>> {
    CURRENT_WORKER.with(|current| current.borrow_mut().take())
}

/// Run `f` with the installed worker state, if any
pub(crate) fn with_current<R>(f: impl FnOnce(Option<&mut WorkerContext>) -> R) -> R {
    CURRENT_WORKER.with(|current| {
        let mut current = current.borrow_mut();
        f(current.as_deref_mut())
    })
}

/// Marks the calling thread as a consumer thread
pub(crate) fn mark_worker_thread() {
    IS_WORKER_THREAD.with(|flag| flag.set(true));
}

/// Whether the calling thread is a consumer thread of some processor
pub(crate) fn is_worker_thread() -> bool {
    IS_WORKER_THREAD.with(|flag| flag.get())
}
