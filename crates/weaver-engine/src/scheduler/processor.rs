//! Task processor
//!
//! A [`TaskProcessor`] owns a fixed set of consumer threads, the task queue
//! they pop from, the coroutine pool task bodies run on and a deadline timer.
//! [`ProcessorHandle`] is the cheap clonable view used to spawn tasks; every
//! task context keeps the shared state alive.

use std::ops::Deref;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::counter::TaskCounter;
use super::task_queue::TaskQueue;
use super::timer::TimerThread;
use super::worker::{self, WorkerContext};
use crate::config::{
    CoroutinePoolConfig, EngineConfig, OverloadAction, TaskProcessorConfig, TaskProcessorSettings,
};
use crate::coro::{Coroutine, CoroutinePool, CoroutinePoolStats};
use crate::error::{CoroutineError, EngineError};
use crate::task::{CancellationReason, DetachedTasksSyncBlock, TaskContext};
use crate::utils;

/// Shutdown logs a warning when tasks keep it waiting this long
const SLOW_SHUTDOWN_REPORT: Duration = Duration::from_secs(5);

/// Task processor statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskProcessorStats {
    /// Tasks created since start
    pub tasks_created: u64,
    /// Tasks that reached a terminal state
    pub tasks_finished: u64,
    /// Tasks created and not finished
    pub tasks_alive: u64,
    /// Cancellation requests that took effect
    pub tasks_cancelled: u64,
    /// Tasks that hit an overload limit
    pub tasks_overloaded: u64,
    /// Approximate number of queued tasks
    pub queue_size: usize,
    /// Number of consumer threads
    pub worker_threads: usize,
    /// Coroutine pool counters
    pub coroutines: CoroutinePoolStats,
    /// Last verdict of the queue wait time sensor
    pub is_overloaded: bool,
}

/// State shared by the processor, its consumers and its tasks
pub(crate) struct ProcessorShared {
    id: u64,
    config: TaskProcessorConfig,
    settings: RwLock<TaskProcessorSettings>,
    queue: TaskQueue,
    pool: CoroutinePool,
    timer: Arc<TimerThread>,
    counter: TaskCounter,
    detached: DetachedTasksSyncBlock,
    worker_count: usize,
    is_shutting_down: AtomicBool,
    is_stopped: AtomicBool,
    is_overloaded: AtomicBool,
}

impl ProcessorShared {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn counter(&self) -> &TaskCounter {
        &self.counter
    }

    pub(crate) fn timer(&self) -> &TimerThread {
        &self.timer
    }

    pub(crate) fn detached(&self) -> &DetachedTasksSyncBlock {
        &self.detached
    }

    /// Queue a task that became runnable
    pub(crate) fn schedule(&self, context: Arc<TaskContext>) {
        if self.is_stopped.load(Ordering::Acquire) {
            context.cancel_unstarted();
            return;
        }
        if self.is_shutting_down.load(Ordering::Acquire) {
            context.request_cancel(CancellationReason::Shutdown);
        }

        let (length_limit, sample_wait_time) = {
            let settings = self.settings.read();
            (
                settings.wait_queue_length_limit,
                settings.wait_queue_time_limit().is_some()
                    || settings.sensor_wait_queue_time_limit().is_some(),
            )
        };
        if length_limit > 0
            && !context.is_critical()
            && self.queue.size_approximate() >= length_limit
        {
            self.handle_overload(&context, "queue length limit reached");
        }
        context.set_queue_wait_timepoint(sample_wait_time.then(Instant::now));

        self.queue.push(context);
    }

    /// Overload verdict for a task that waited in the queue
    fn check_wait_time(&self, context: &Arc<TaskContext>) {
        let Some(queued_at) = context.queue_wait_timepoint() else {
            return;
        };
        context.set_queue_wait_timepoint(None);
        let waited = queued_at.elapsed();
        let (time_limit, sensor_limit) = {
            let settings = self.settings.read();
            (
                settings.wait_queue_time_limit(),
                settings.sensor_wait_queue_time_limit(),
            )
        };
        if let Some(limit) = sensor_limit {
            let overloaded = waited >= limit;
            if self.is_overloaded.swap(overloaded, Ordering::Relaxed) != overloaded {
                debug!(processor = %self.name(), overloaded, ?waited, "overload sensor changed");
            }
        }
        if time_limit.is_some_and(|limit| waited >= limit) && !context.is_critical() {
            self.handle_overload(context, "queue wait time limit reached");
        }
    }

    fn handle_overload(&self, context: &Arc<TaskContext>, cause: &'static str) {
        self.counter.account_task_overload();
        let action = self.settings.read().overload_action;
        warn!(processor = %self.name(), task_id = %context.id(), ?action, cause, "task processor overloaded");
        if action == OverloadAction::Cancel {
            context.request_cancel(CancellationReason::Overload);
        }
    }

    /// Take an idle coroutine, preferring the calling worker's cache
    pub(crate) fn acquire_coroutine(&self) -> Result<Coroutine, CoroutineError> {
        worker::with_current(|worker| {
            let cache = worker
                .filter(|worker| worker.processor_id == self.id)
                .map(|worker| &mut worker.coroutines);
            self.pool.get_coroutine(cache)
        })
    }

    pub(crate) fn release_coroutine(&self, coroutine: Coroutine) {
        worker::with_current(|worker| {
            let cache = worker
                .filter(|worker| worker.processor_id == self.id)
                .map(|worker| &mut worker.coroutines);
            self.pool.put_coroutine(cache, coroutine);
        });
    }

    fn stats(&self) -> TaskProcessorStats {
        let tasks_finished = self.counter.finished();
        let tasks_created = self.counter.created();
        TaskProcessorStats {
            tasks_created,
            tasks_finished,
            tasks_alive: tasks_created.saturating_sub(tasks_finished),
            tasks_cancelled: self.counter.cancelled(),
            tasks_overloaded: self.counter.overloaded(),
            queue_size: self.queue.size_approximate(),
            worker_threads: self.worker_count,
            coroutines: self.pool.stats(),
            is_overloaded: self.is_overloaded.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ProcessorShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorShared")
            .field("id", &self.id)
            .field("name", &self.config.name)
            .field("queue", &self.queue)
            .field("pool", &self.pool)
            .finish()
    }
}

/// Consumer thread body
fn run_consumer(shared: Arc<ProcessorShared>, mut worker: Box<WorkerContext>) {
    worker::mark_worker_thread();
    debug!(processor = %shared.name(), consumer = worker.index, "consumer started");

    while let Some(context) = shared.queue.pop_blocking(&mut worker) {
        shared.check_wait_time(&context);

        worker::install(Some(worker));
        if panic::catch_unwind(AssertUnwindSafe(|| context.do_step())).is_err() {
            utils::abort_with_stacktrace(&format!("task {} step panicked", context.id()));
        }
        worker = match worker::uninstall() {
            Some(worker) => worker,
            None => utils::abort_with_stacktrace("worker state lost during a task step"),
        };

        if context.is_finished() {
            context.finish_detached();
        }
    }

    shared.pool.flush_local(&mut worker.coroutines);
    debug!(processor = %shared.name(), consumer = worker.index, "consumer stopped");
}

/// Clonable handle to a running task processor
#[derive(Clone)]
pub struct ProcessorHandle {
    shared: Arc<ProcessorShared>,
}

impl ProcessorHandle {
    pub(crate) fn from_shared(shared: Arc<ProcessorShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<ProcessorShared> {
        &self.shared
    }

    /// Processor name
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Number of consumer threads
    pub fn worker_threads(&self) -> usize {
        self.shared.worker_count
    }

    /// Current statistics
    pub fn stats(&self) -> TaskProcessorStats {
        self.shared.stats()
    }

    /// Current runtime settings
    pub fn settings(&self) -> TaskProcessorSettings {
        self.shared.settings.read().clone()
    }

    /// Replace the runtime settings
    pub fn set_settings(&self, settings: TaskProcessorSettings) {
        debug!(processor = %self.name(), ?settings, "task processor settings updated");
        *self.shared.settings.write() = settings;
    }
}

impl std::fmt::Debug for ProcessorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorHandle")
            .field("name", &self.name())
            .finish()
    }
}

/// Owner of the consumer threads; shuts the processor down when dropped.
///
/// Shutdown cancels detached tasks, waits until every task of the processor
/// has finished, then stops and joins the consumers and the timer. Tasks
/// scheduled while shutting down are cancelled with
/// [`CancellationReason::Shutdown`].
pub struct TaskProcessor {
    handle: ProcessorHandle,
    workers: Vec<JoinHandle<()>>,
}

impl TaskProcessor {
    /// Start a processor with default pool and settings
    pub fn new(config: TaskProcessorConfig) -> Result<Self, EngineError> {
        Self::with_pool(
            config,
            CoroutinePoolConfig::default(),
            TaskProcessorSettings::default(),
        )
    }

    /// Start a processor from a complete engine configuration
    pub fn from_config(config: &EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        Self::with_pool(
            config.task_processor.clone(),
            config.coro_pool.clone(),
            config.settings.clone(),
        )
    }

    /// Start a processor with explicit pool configuration and settings
    pub fn with_pool(
        config: TaskProcessorConfig,
        pool_config: CoroutinePoolConfig,
        settings: TaskProcessorSettings,
    ) -> Result<Self, EngineError> {
        static NEXT_PROCESSOR_ID: AtomicU64 = AtomicU64::new(1);

        config.validate()?;
        let id = NEXT_PROCESSOR_ID.fetch_add(1, Ordering::Relaxed);
        let worker_count = config.effective_worker_threads();
        let pool = CoroutinePool::from_config(pool_config, &config.thread_name)?;
        let queue = TaskQueue::new(config.task_queue, id, worker_count, config.spinning_iterations);

        let shared = Arc::new(ProcessorShared {
            id,
            settings: RwLock::new(settings),
            queue,
            pool,
            timer: TimerThread::new(),
            counter: TaskCounter::new(),
            detached: DetachedTasksSyncBlock::new(),
            worker_count,
            is_shutting_down: AtomicBool::new(false),
            is_stopped: AtomicBool::new(false),
            is_overloaded: AtomicBool::new(false),
            config,
        });

        let mut processor = Self {
            handle: ProcessorHandle::from_shared(shared.clone()),
            workers: Vec::with_capacity(worker_count),
        };

        shared
            .timer
            .start(format!("{}-timer", shared.config.thread_name))
            .map_err(EngineError::Thread)?;

        for index in 0..worker_count {
            let worker = Box::new(WorkerContext::new(id, index, shared.queue.take_local(index)));
            let thread_shared = shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", shared.config.thread_name))
                .spawn(move || run_consumer(thread_shared, worker));
            match spawned {
                Ok(handle) => processor.workers.push(handle),
                // dropping the processor stops what was started
                Err(err) => return Err(EngineError::Thread(err)),
            }
        }

        info!(
            processor = %shared.name(),
            worker_threads = worker_count,
            queue = ?shared.queue.queue_type(),
            "task processor started"
        );
        Ok(processor)
    }

    /// Handle for spawning tasks from other threads
    pub fn handle(&self) -> ProcessorHandle {
        self.handle.clone()
    }

    /// Shut the processor down, waiting for its tasks
    pub fn shutdown(self) {
        drop(self);
    }

    fn stop(&mut self) {
        let shared = self.handle.shared.clone();
        uassert!(
            worker::with_current(|worker| worker.map(|worker| worker.processor_id)) != Some(shared.id),
            "task processor {} shut down from its own task",
            shared.name()
        );

        shared.is_shutting_down.store(true, Ordering::Release);
        debug!(
            processor = %shared.name(),
            alive = shared.counter.alive(),
            detached = shared.detached.len(),
            "task processor shutting down"
        );
        shared.detached.request_cancellation(CancellationReason::Shutdown);

        if !self.workers.is_empty() {
            shared.detached.wait_all();
            shared.counter.wait_idle(SLOW_SHUTDOWN_REPORT, |alive| {
                warn!(
                    processor = %shared.name(),
                    alive,
                    "shutdown is waiting for tasks that do not finish"
                );
            });
        }

        shared.is_stopped.store(true, Ordering::Release);
        shared.queue.stop();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        for context in shared.queue.drain() {
            context.cancel_unstarted();
        }
        shared.timer.stop();
        shared.pool.clear();
        info!(processor = %shared.name(), "task processor stopped");
    }
}

impl Deref for TaskProcessor {
    type Target = ProcessorHandle;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl Drop for TaskProcessor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for TaskProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskProcessor")
            .field("shared", &self.handle.shared)
            .field("workers", &self.workers.len())
            .finish()
    }
}
