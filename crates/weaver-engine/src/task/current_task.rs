//! API for code running inside a task.
//!
//! Functions that suspend (`sleep_*`, `yield_now`) must be called from a
//! task; calling them from a plain OS thread is a programming error.
//! Cancellation queries return neutral values outside of tasks.

use std::cell::RefCell;
use std::panic;
use std::sync::Arc;
use std::time::Duration;

use super::cancel::{CancellationReason, CoroUnwinder};
use super::context::{TaskContext, TaskId};
use super::handle::TaskWithResult;
use super::spawn::SpawnOptions;
use super::wait::NoopWaitStrategy;
use crate::deadline::Deadline;
use crate::scheduler::{worker, ProcessorHandle};

thread_local! {
    /// Task executed by the current coroutine thread
    static CURRENT: RefCell<Option<Arc<TaskContext>>> = const { RefCell::new(None) };
}

pub(crate) fn set_current(context: Option<Arc<TaskContext>>) {
    CURRENT.with(|current| *current.borrow_mut() = context);
}

/// Context of the running task, if any
pub(crate) fn try_context() -> Option<Arc<TaskContext>> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Context of the running task. Panics outside of a task.
#[track_caller]
pub(crate) fn context() -> Arc<TaskContext> {
    match try_context() {
        Some(context) => context,
        None => crate::utils::invariant_failed(format_args!(
            "current task requested outside of a task processor coroutine"
        )),
    }
}

pub(crate) fn is_current(context: &TaskContext) -> bool {
    CURRENT.with(|current| {
        current
            .borrow()
            .as_ref()
            .is_some_and(|current| std::ptr::eq(current.as_ref(), context))
    })
}

/// Whether the calling code runs inside a task
pub fn is_in_task() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Whether the calling thread belongs to a task processor
pub fn is_task_processor_thread() -> bool {
    is_in_task() || worker::is_worker_thread()
}

/// Id of the running task
pub fn task_id() -> Option<TaskId> {
    try_context().map(|context| context.id())
}

/// Processor running the current task
#[track_caller]
pub fn task_processor() -> ProcessorHandle {
    ProcessorHandle::from_shared(context().processor().clone())
}

/// Whether cancellation was requested and may interrupt the task now
pub fn should_cancel() -> bool {
    try_context().is_some_and(|context| context.should_cancel())
}

/// Whether cancellation was requested, even if currently blocked
pub fn is_cancel_requested() -> bool {
    try_context().is_some_and(|context| context.is_cancel_requested())
}

/// Reason of the requested cancellation
pub fn cancellation_reason() -> CancellationReason {
    try_context().map_or(CancellationReason::None, |context| {
        context.cancellation_reason()
    })
}

/// Unwind the task if its cancellation may take effect.
///
/// The task ends in state `Cancelled`; destructors on its stack run as the
/// stack unwinds. No-op outside of tasks.
pub fn cancellation_point() {
    let Some(context) = try_context() else {
        return;
    };
    if context.should_cancel() {
        // the unwinding body must not be interrupted again
        context.set_cancellable(false);
        drop(context);
        panic::resume_unwind(Box::new(CoroUnwinder));
    }
}

/// Let other tasks run. The task is requeued immediately.
#[track_caller]
pub fn yield_now() {
    let context = context();
    let _blocker = CancellationBlocker::new();
    context.sleep(&mut NoopWaitStrategy, Deadline::passed());
}

/// Sleep for `duration`, ignoring cancellation
#[track_caller]
pub fn sleep_for(duration: Duration) {
    sleep_until(Deadline::from_duration(duration));
}

/// Sleep until `deadline`, ignoring cancellation
#[track_caller]
pub fn sleep_until(deadline: Deadline) {
    let context = context();
    let _blocker = CancellationBlocker::new();
    context.sleep(&mut NoopWaitStrategy, deadline);
}

/// Sleep for `duration` or until cancellation is requested
#[track_caller]
pub fn interruptible_sleep_for(duration: Duration) {
    interruptible_sleep_until(Deadline::from_duration(duration));
}

/// Sleep until `deadline` or until cancellation is requested
#[track_caller]
pub fn interruptible_sleep_until(deadline: Deadline) {
    let context = context();
    context.sleep(&mut NoopWaitStrategy, deadline);
}

/// Cancel the current task once `deadline` expires
#[track_caller]
pub fn set_deadline(deadline: Deadline) {
    context().set_cancel_deadline(deadline);
}

/// Spawn a task on the current task processor
#[track_caller]
pub fn spawn<F, T>(func: F) -> TaskWithResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task_processor().spawn(func)
}

/// Spawn a critical task on the current task processor
#[track_caller]
pub fn spawn_critical<F, T>(func: F) -> TaskWithResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task_processor().spawn_critical(func)
}

/// Spawn a task with explicit options on the current task processor
#[track_caller]
pub fn spawn_with<F, T>(options: SpawnOptions, func: F) -> TaskWithResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    task_processor().spawn_with(options, func)
}

/// Makes the current task non-cancellable while alive.
///
/// Restores the previous setting on drop. Does nothing outside of tasks.
#[derive(Debug)]
pub struct CancellationBlocker {
    context: Option<Arc<TaskContext>>,
    was_cancellable: bool,
}

impl CancellationBlocker {
    /// Block cancellation of the current task
    pub fn new() -> Self {
        let context = try_context();
        let was_cancellable = context
            .as_ref()
            .map_or(false, |context| context.set_cancellable(false));
        Self {
            context,
            was_cancellable,
        }
    }
}

impl Default for CancellationBlocker {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CancellationBlocker {
    fn drop(&mut self) {
        if let Some(context) = &self.context {
            context.set_cancellable(self.was_cancellable);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use crate::task::TaskState;
    use std::time::Instant;

    #[test]
    fn test_outside_of_task() {
        assert!(!is_in_task());
        assert!(!should_cancel());
        assert_eq!(cancellation_reason(), CancellationReason::None);
        assert_eq!(task_id(), None);
        cancellation_point();
        let _blocker = CancellationBlocker::new();
    }

    #[test]
    fn test_inside_task() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(|| (is_in_task(), is_task_processor_thread(), task_id()));
        let id = task.id();
        let (in_task, in_processor, seen_id) = task.get().unwrap();
        assert!(in_task);
        assert!(in_processor);
        assert_eq!(seen_id, Some(id));
    }

    #[test]
    fn test_interruptible_sleep_cancelled() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(|| {
            let started = Instant::now();
            interruptible_sleep_for(Duration::from_secs(20));
            let elapsed = started.elapsed();
            cancellation_point();
            elapsed
        });
        std::thread::sleep(Duration::from_millis(20));
        task.request_cancel();
        task.wait().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        assert_eq!(task.cancellation_reason(), CancellationReason::UserRequest);
    }

    #[test]
    fn test_sleep_ignores_cancellation() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(|| {
            let started = Instant::now();
            sleep_for(Duration::from_millis(50));
            (started.elapsed(), is_cancel_requested())
        });
        std::thread::sleep(Duration::from_millis(5));
        task.request_cancel();
        let (elapsed, requested) = task.get().unwrap();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(requested);
    }

    #[test]
    fn test_blocker_restores_previous_state() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let states = processor
            .spawn(|| {
                let context = context();
                let before = context.is_cancellable();
                let inside = {
                    let _outer = CancellationBlocker::new();
                    let _inner = CancellationBlocker::new();
                    context.is_cancellable()
                };
                (before, inside, context.is_cancellable())
            })
            .get()
            .unwrap();
        assert_eq!(states, (true, false, true));
    }

    #[test]
    fn test_set_deadline_cancels() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(|| {
            set_deadline(Deadline::from_duration(Duration::from_millis(10)));
            interruptible_sleep_for(Duration::from_secs(20));
            cancellation_reason()
        });
        assert_eq!(task.get().unwrap(), CancellationReason::Deadline);
    }

    #[test]
    fn test_yield_lets_others_run() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let observer = flag.clone();
        let task = processor.spawn(move || {
            let setter = spawn(move || flag.store(true, std::sync::atomic::Ordering::SeqCst));
            while !observer.load(std::sync::atomic::Ordering::SeqCst) {
                yield_now();
            }
            setter.get().is_ok()
        });
        assert!(task.get().unwrap());
    }
}
