//! Per-task state machine
//!
//! A [`TaskContext`] is shared between the processor queues, wait lists,
//! timers and the user-facing handles through `Arc`. Only the worker that
//! popped it runs its coroutine; every other party interacts with it through
//! atomic wakeups and cancellation requests.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, trace};

use super::cancel::{CancellationReason, CoroUnwinder, Importance, TaskState, WakeupSource, YieldReason};
use super::current_task;
use super::payload::WrappedCall;
use super::sleep_state::{AtomicSleepState, Epoch, SleepFlags, SleepState};
use super::spawn::SpawnOptions;
use super::wait::{AccessorsWaitStrategy, ContextAccessor, EarlyWakeup, WaitStrategy};
use crate::coro::{self, Coroutine};
use crate::deadline::Deadline;
use crate::error::WaitInterruptedError;
use crate::scheduler::{ProcessorShared, TimerKey};
use crate::utils;
use crate::wait_list::GenericWaitList;

/// Unique task identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw id value, never zero
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

const DETACH_NONE: u8 = 0;
const DETACH_DETACHED: u8 = 1;
const DETACH_FINISHED: u8 = 2;

/// Shared state of one task
pub struct TaskContext {
    /// Unique id
    id: TaskId,
    /// Processor the task runs on
    processor: Arc<ProcessorShared>,
    /// Started as critical
    is_critical: bool,
    /// Scheduled through the background queue
    is_background: bool,
    /// Current [`TaskState`]
    state: AtomicU8,
    /// Detach handshake with the processor registry
    detach_state: AtomicU8,
    /// Whether cancellation may interrupt waits
    is_cancellable: AtomicBool,
    /// First requested [`CancellationReason`]
    cancellation_reason: AtomicU8,
    /// Deadline after which the task is cancelled
    cancel_deadline: Mutex<Deadline>,
    /// Invalidates cancellation timers armed for an older deadline
    cancel_generation: AtomicU64,
    /// Pending cancellation timer entry
    cancel_timer: Mutex<Option<TimerKey>>,
    /// Pending timer entry of the current sleep
    sleep_timer: Mutex<Option<TimerKey>>,
    /// Wakeup flags and epoch
    sleep_state: AtomicSleepState,
    /// Guards against nested sleeps
    within_sleep: AtomicBool,
    /// Why the coroutine last handed control back
    yield_reason: AtomicU8,
    /// A coroutine is bound to the task
    has_coroutine: AtomicBool,
    /// Bound coroutine while suspended
    coroutine: Mutex<Option<Coroutine>>,
    /// Task body, taken when it starts
    payload: Mutex<Option<Box<dyn WrappedCall>>>,
    /// Tasks waiting for completion
    finish_waiters: GenericWaitList,
    /// Completion flag for waiters outside of tasks
    finished: Mutex<bool>,
    finished_cv: Condvar,
    /// When the task was last queued, if sampled
    queue_wait_timepoint: Mutex<Option<Instant>>,
    /// Span entered while the body runs
    span: Option<tracing::Span>,
}

impl TaskContext {
    /// Create a new task context in state `New`
    pub(crate) fn new(
        processor: Arc<ProcessorShared>,
        options: &SpawnOptions,
        payload: Box<dyn WrappedCall>,
    ) -> Arc<Self> {
        let id = TaskId::next();
        processor.counter().account_task_created();
        let span = options
            .span
            .then(|| tracing::debug_span!("task", task_id = %id, processor = %processor.name()));
        let context = Arc::new(Self {
            id,
            processor,
            is_critical: options.importance == Importance::Critical,
            is_background: options.background,
            state: AtomicU8::new(TaskState::New as u8),
            detach_state: AtomicU8::new(DETACH_NONE),
            is_cancellable: AtomicBool::new(true),
            cancellation_reason: AtomicU8::new(CancellationReason::None as u8),
            cancel_deadline: Mutex::new(options.deadline),
            cancel_generation: AtomicU64::new(0),
            cancel_timer: Mutex::new(None),
            sleep_timer: Mutex::new(None),
            sleep_state: AtomicSleepState::new(SleepState::new(SleepFlags::SLEEPING, Epoch(0))),
            within_sleep: AtomicBool::new(false),
            yield_reason: AtomicU8::new(YieldReason::None as u8),
            has_coroutine: AtomicBool::new(false),
            coroutine: Mutex::new(None),
            payload: Mutex::new(Some(payload)),
            finish_waiters: GenericWaitList::new(options.wait_mode),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            queue_wait_timepoint: Mutex::new(None),
            span,
        });
        trace!(task_id = %context.id, "task created");
        context
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Whether the task reached a terminal state
    pub fn is_finished(&self) -> bool {
        self.state().is_finished()
    }

    /// Requested cancellation reason, `None` if not requested
    pub fn cancellation_reason(&self) -> CancellationReason {
        CancellationReason::from_u8(self.cancellation_reason.load(Ordering::Acquire))
    }

    /// Whether cancellation has been requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancellation_reason() != CancellationReason::None
    }

    /// Whether a cancellation request may interrupt the task right now
    pub fn should_cancel(&self) -> bool {
        self.is_cancel_requested() && self.is_cancellable()
    }

    pub(crate) fn is_cancellable(&self) -> bool {
        self.is_cancellable.load(Ordering::Acquire)
    }

    /// Returns the previous value
    pub(crate) fn set_cancellable(&self, value: bool) -> bool {
        self.is_cancellable.swap(value, Ordering::AcqRel)
    }

    /// Critical tasks are exempt from overload cancellation. A task that
    /// already started must be allowed to run to observe its cancellation.
    pub(crate) fn is_critical(&self) -> bool {
        self.is_critical || self.has_coroutine.load(Ordering::Acquire)
    }

    pub(crate) fn is_background(&self) -> bool {
        self.is_background
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detach_state.load(Ordering::Acquire) == DETACH_DETACHED
    }

    pub(crate) fn processor(&self) -> &Arc<ProcessorShared> {
        &self.processor
    }

    pub(crate) fn epoch(&self) -> Epoch {
        self.sleep_state.load().epoch
    }

    pub(crate) fn queue_wait_timepoint(&self) -> Option<Instant> {
        *self.queue_wait_timepoint.lock()
    }

    pub(crate) fn set_queue_wait_timepoint(&self, at: Option<Instant>) {
        *self.queue_wait_timepoint.lock() = at;
    }

    /// Ask the task to stop. Only the first reason is recorded.
    pub fn request_cancel(self: &Arc<Self>, reason: CancellationReason) {
        if reason == CancellationReason::None {
            return;
        }
        let swapped = self.cancellation_reason.compare_exchange(
            CancellationReason::None as u8,
            reason as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_ok() {
            trace!(task_id = %self.id, %reason, "cancellation requested");
            self.processor.counter().account_task_cancel();
            let epoch = self.epoch();
            self.wakeup(WakeupSource::CancelRequest, epoch);
        }
    }

    /// Schedule the task for its first step
    pub(crate) fn start(self: &Arc<Self>) {
        let epoch = self.epoch();
        self.wakeup(WakeupSource::Bootstrap, epoch);
    }

    /// Replace the cancellation deadline of a running task
    pub(crate) fn set_cancel_deadline(self: &Arc<Self>, deadline: Deadline) {
        *self.cancel_deadline.lock() = deadline;
        self.arm_cancellation_timer();
    }

    fn arm_cancellation_timer(self: &Arc<Self>) {
        let deadline = *self.cancel_deadline.lock();
        let generation = self.cancel_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let mut slot = self.cancel_timer.lock();
        if let Some(key) = slot.take() {
            self.processor.timer().withdraw(key);
        }
        if !deadline.is_reachable() {
            return;
        }
        if deadline.is_reached() {
            drop(slot);
            self.request_cancel(CancellationReason::Deadline);
            return;
        }
        *slot = self
            .processor
            .timer()
            .cancel_at(deadline, Arc::downgrade(self), generation);
    }

    /// Called by the timer thread when a cancellation deadline expires
    pub(crate) fn on_cancel_deadline(self: &Arc<Self>, generation: u64) {
        if self.cancel_generation.load(Ordering::Acquire) == generation {
            self.request_cancel(CancellationReason::Deadline);
        }
    }

    fn arm_deadline_timer(self: &Arc<Self>, deadline: Deadline, epoch: Epoch) {
        if deadline.is_reached() {
            // cheap path for yields and already expired waits
            self.wakeup(WakeupSource::DeadlineTimer, epoch);
            return;
        }
        *self.sleep_timer.lock() = self
            .processor
            .timer()
            .wakeup_at(deadline, Arc::downgrade(self), epoch);
    }

    /// Drop the timer entry of a sleep that ended, unless it fired
    fn disarm_deadline_timer(&self, source: WakeupSource) {
        let Some(key) = self.sleep_timer.lock().take() else {
            return;
        };
        if source != WakeupSource::DeadlineTimer {
            self.processor.timer().withdraw(key);
        }
    }

    /// Suspend the current task until a wakeup arrives.
    ///
    /// Must be called by the task itself. Returns what woke it.
    pub(crate) fn sleep(self: &Arc<Self>, strategy: &mut dyn WaitStrategy, deadline: Deadline) -> WakeupSource {
        uassert!(
            current_task::is_current(self),
            "sleep called outside of the task's own coroutine"
        );
        uassert!(
            self.state() == TaskState::Running,
            "sleep called in state {}",
            self.state()
        );
        uassert!(
            !self.within_sleep.swap(true, Ordering::AcqRel),
            "recursion in sleep is forbidden"
        );

        if self.should_cancel() {
            self.within_sleep.store(false, Ordering::Release);
            return WakeupSource::CancelRequest;
        }

        let sleep_epoch = self.epoch();
        let cancel_deadline = *self.cancel_deadline.lock();
        let has_deadline =
            deadline.is_reachable() && (!self.is_cancellable() || deadline < cancel_deadline);
        if has_deadline {
            self.arm_deadline_timer(deadline, sleep_epoch);
        }

        let EarlyWakeup(early) = strategy.setup_wakeups();
        if early {
            self.sleep_state
                .fetch_or_flags(SleepFlags::WAKEUP_BY_WAIT_LIST);
        } else {
            self.yield_reason
                .store(YieldReason::TaskWaiting as u8, Ordering::Release);
            coro::suspend();
        }

        strategy.disable_wakeups();

        let woken = self.sleep_state.load();
        let source = primary_wakeup_source(woken.flags);
        self.disarm_deadline_timer(source);
        self.sleep_state
            .store(SleepState::new(SleepFlags::empty(), sleep_epoch.next()));
        self.within_sleep.store(false, Ordering::Release);
        source
    }

    /// Deliver a wakeup aimed at the sleep with `epoch`. Stale epochs are
    /// ignored.
    pub(crate) fn wakeup(self: &Arc<Self>, source: WakeupSource, epoch: Epoch) {
        if self.is_finished() {
            return;
        }
        let flag = wakeup_flag(source);
        let mut prev = self.sleep_state.load();
        loop {
            if prev.epoch != epoch {
                return;
            }
            let next = SleepState::new(prev.flags | flag, prev.epoch);
            match self.sleep_state.compare_exchange_weak(prev, next) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
        if should_schedule(prev.flags, source) {
            self.schedule();
        }
    }

    fn schedule(self: &Arc<Self>) {
        uassert!(
            self.state() != TaskState::Queued,
            "task {} scheduled twice",
            self.id
        );
        self.set_state(TaskState::Queued);
        self.processor.schedule(self.clone());
    }

    fn set_state(&self, new_state: TaskState) {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            let old_state = TaskState::from_u8(current);
            if old_state.is_finished() || old_state == new_state {
                return;
            }
            match self.state.compare_exchange(
                current,
                new_state as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if new_state.is_finished() {
            if let Some(key) = self.cancel_timer.lock().take() {
                self.processor.timer().withdraw(key);
            }
            self.finish_waiters.wakeup_all();
            let mut finished = self.finished.lock();
            *finished = true;
            self.finished_cv.notify_all();
        }
    }

    /// Run the task until it suspends or finishes. Called on a worker.
    pub(crate) fn do_step(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }

        let mut clear_flags = SleepFlags::SLEEPING;
        let bound = self.coroutine.lock().take();
        let coroutine = match bound {
            Some(coroutine) => coroutine,
            None => match self.processor.acquire_coroutine() {
                Ok(coroutine) => {
                    clear_flags |= SleepFlags::WAKEUP_BY_BOOTSTRAP;
                    self.has_coroutine.store(true, Ordering::Release);
                    self.arm_cancellation_timer();
                    coroutine
                }
                Err(err) => utils::abort_with_stacktrace(&format!(
                    "cannot start task {}: {err}",
                    self.id
                )),
            },
        };

        self.sleep_state.clear_flags(clear_flags);
        self.set_state(TaskState::Running);
        coroutine.resume(self);

        match YieldReason::from_u8(self.yield_reason.load(Ordering::Acquire)) {
            reason @ (YieldReason::TaskComplete | YieldReason::TaskCancelled) => {
                self.processor.release_coroutine(coroutine);
                self.has_coroutine.store(false, Ordering::Release);
                let new_state = if reason == YieldReason::TaskComplete {
                    TaskState::Completed
                } else {
                    TaskState::Cancelled
                };
                self.processor.counter().account_task_finished();
                self.set_state(new_state);
                trace!(task_id = %self.id, state = %new_state, "task finished");
            }
            YieldReason::TaskWaiting => {
                *self.coroutine.lock() = Some(coroutine);
                self.set_state(TaskState::Suspended);

                let mut new_flags = SleepFlags::SLEEPING;
                let cancellable = self.is_cancellable();
                if !cancellable {
                    new_flags |= SleepFlags::NON_CANCELLABLE;
                }
                let prev = self.sleep_state.fetch_or_flags(new_flags);
                uassert!(
                    !prev.flags.contains(SleepFlags::SLEEPING),
                    "task {} was already sleeping",
                    self.id
                );

                let mut flags = prev.flags;
                if !cancellable {
                    flags.remove(SleepFlags::WAKEUP_BY_CANCEL_REQUEST);
                }
                if flags.intersects(SleepFlags::WAKEUP_MASK) {
                    self.schedule();
                }
            }
            YieldReason::None => {
                utils::abort_with_stacktrace(&format!(
                    "task {} yielded without a reason",
                    self.id
                ));
            }
        }
    }

    /// Coroutine entry for one task. Never unwinds.
    pub(crate) fn coro_func(self: &Arc<Self>) {
        self.yield_reason
            .store(YieldReason::None as u8, Ordering::Release);

        let payload = self.payload.lock().take();
        let Some(mut payload) = payload else {
            self.yield_reason
                .store(YieldReason::TaskComplete as u8, Ordering::Release);
            return;
        };

        if self.is_cancel_requested() && !self.is_critical {
            // the body never starts; its captures are dropped here
            self.set_cancellable(false);
            drop(payload);
            self.yield_reason
                .store(YieldReason::TaskCancelled as u8, Ordering::Release);
            return;
        }

        let _entered = self.span.as_ref().map(|span| span.enter());
        let reason = match panic::catch_unwind(AssertUnwindSafe(|| payload.perform())) {
            Ok(()) => YieldReason::TaskComplete,
            Err(unwind) if unwind.is::<CoroUnwinder>() => {
                trace!(task_id = %self.id, "task stack unwound by cancellation");
                YieldReason::TaskCancelled
            }
            Err(unwind) => {
                let message = utils::panic_message(unwind.as_ref());
                if self.is_detached() {
                    error!(task_id = %self.id, %message, "detached task panicked");
                } else {
                    debug!(task_id = %self.id, %message, "task panicked");
                }
                payload.store_panic(message);
                YieldReason::TaskComplete
            }
        };
        if panic::catch_unwind(AssertUnwindSafe(move || drop(payload))).is_err() {
            error!(task_id = %self.id, "task payload panicked while being dropped");
        }
        self.yield_reason.store(reason as u8, Ordering::Release);
    }

    /// Finish a task that never ran because its processor has stopped
    pub(crate) fn cancel_unstarted(self: &Arc<Self>) {
        let _ = self.cancellation_reason.compare_exchange(
            CancellationReason::None as u8,
            CancellationReason::Shutdown as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.set_cancellable(false);
        let payload = self.payload.lock().take();
        drop(payload);
        self.processor.counter().account_task_finished();
        self.set_state(TaskState::Cancelled);
        self.finish_detached();
    }

    /// Wait for completion. A cancelled waiter gets `WaitInterruptedError`;
    /// reaching the deadline returns `Ok` with the task still running.
    pub(crate) fn wait_until(self: &Arc<Self>, deadline: Deadline) -> Result<(), WaitInterruptedError> {
        if self.is_finished() {
            return Ok(());
        }
        match current_task::try_context() {
            Some(current) => {
                let targets: [&dyn ContextAccessor; 1] = [self.as_ref()];
                let mut strategy = AccessorsWaitStrategy::new(&current, &targets);
                let source = current.sleep(&mut strategy, deadline);
                if !self.is_finished() && source == WakeupSource::CancelRequest {
                    return Err(WaitInterruptedError(current.cancellation_reason()));
                }
                Ok(())
            }
            None => {
                self.wait_blocking(deadline);
                Ok(())
            }
        }
    }

    /// Wait for completion ignoring cancellation of the waiter
    pub(crate) fn wait_non_cancellable(self: &Arc<Self>) {
        if self.is_finished() {
            return;
        }
        if current_task::try_context().is_some() {
            let _blocker = current_task::CancellationBlocker::new();
            while !self.is_finished() {
                let _ = self.wait_until(Deadline::unreachable());
            }
        } else {
            self.wait_blocking(Deadline::unreachable());
        }
    }

    /// Blocks an OS thread that is not running a task
    fn wait_blocking(&self, deadline: Deadline) {
        let mut finished = self.finished.lock();
        while !*finished {
            match deadline.instant() {
                Some(at) => {
                    if self.finished_cv.wait_until(&mut finished, at).timed_out() {
                        break;
                    }
                }
                None => self.finished_cv.wait(&mut finished),
            }
        }
    }

    /// Hand the task over to the processor's detached registry
    pub(crate) fn set_detached(self: &Arc<Self>) {
        let registry = self.processor.detached();
        registry.add(self.clone());
        if self
            .detach_state
            .compare_exchange(
                DETACH_NONE,
                DETACH_DETACHED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            // finished before the registry entry became visible
            registry.remove(self.id);
        }
    }

    /// Called once the task is finished
    pub(crate) fn finish_detached(&self) {
        if self.detach_state.swap(DETACH_FINISHED, Ordering::AcqRel) == DETACH_DETACHED {
            self.processor.detached().remove(self.id);
        }
    }
}

impl ContextAccessor for TaskContext {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        uassert!(
            !std::ptr::eq(waiter.as_ref(), self),
            "task {} waits for itself, which would deadlock",
            self.id
        );
        self.finish_waiters.append(waiter);
        EarlyWakeup(self.is_finished())
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.finish_waiters.remove(waiter);
    }
}

impl Drop for TaskContext {
    fn drop(&mut self) {
        if TaskState::from_u8(*self.state.get_mut()) == TaskState::New {
            self.processor.counter().account_task_finished();
        }
    }
}

impl fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("cancellation_reason", &self.cancellation_reason())
            .field("sleep_state", &self.sleep_state)
            .finish()
    }
}

fn wakeup_flag(source: WakeupSource) -> SleepFlags {
    match source {
        WakeupSource::WaitList => SleepFlags::WAKEUP_BY_WAIT_LIST,
        WakeupSource::DeadlineTimer => SleepFlags::WAKEUP_BY_DEADLINE_TIMER,
        WakeupSource::CancelRequest => SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
        WakeupSource::Bootstrap => SleepFlags::WAKEUP_BY_BOOTSTRAP,
        WakeupSource::None => SleepFlags::empty(),
    }
}

/// Whether the wakeup that set its flag over `prev` must reschedule the task
fn should_schedule(prev: SleepFlags, source: WakeupSource) -> bool {
    if !prev.contains(SleepFlags::SLEEPING) {
        return false;
    }
    let non_cancellable = prev.contains(SleepFlags::NON_CANCELLABLE);
    let already_woken = prev.intersects(
        SleepFlags::WAKEUP_BY_WAIT_LIST
            | SleepFlags::WAKEUP_BY_DEADLINE_TIMER
            | SleepFlags::WAKEUP_BY_BOOTSTRAP,
    ) || (prev.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST) && !non_cancellable);
    if already_woken {
        return false;
    }
    !(source == WakeupSource::CancelRequest && non_cancellable)
}

fn primary_wakeup_source(flags: SleepFlags) -> WakeupSource {
    if flags.contains(SleepFlags::WAKEUP_BY_WAIT_LIST) {
        WakeupSource::WaitList
    } else if flags.contains(SleepFlags::WAKEUP_BY_DEADLINE_TIMER) {
        WakeupSource::DeadlineTimer
    } else if flags.contains(SleepFlags::WAKEUP_BY_BOOTSTRAP) {
        WakeupSource::Bootstrap
    } else if flags.contains(SleepFlags::WAKEUP_BY_CANCEL_REQUEST) {
        WakeupSource::CancelRequest
    } else {
        uassert!(false, "cannot find a valid wakeup source in {:?}", flags);
        WakeupSource::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_should_schedule_requires_sleeping() {
        assert!(!should_schedule(SleepFlags::empty(), WakeupSource::WaitList));
        assert!(should_schedule(SleepFlags::SLEEPING, WakeupSource::WaitList));
        assert!(should_schedule(SleepFlags::SLEEPING, WakeupSource::CancelRequest));
    }

    #[test]
    fn test_should_schedule_once() {
        let woken = SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_WAIT_LIST;
        assert!(!should_schedule(woken, WakeupSource::DeadlineTimer));
        assert!(!should_schedule(woken, WakeupSource::CancelRequest));
    }

    #[test]
    fn test_should_schedule_non_cancellable() {
        let sleeping = SleepFlags::SLEEPING | SleepFlags::NON_CANCELLABLE;
        assert!(!should_schedule(sleeping, WakeupSource::CancelRequest));
        // an ignored cancel request does not count as a wakeup
        let cancel_seen = sleeping | SleepFlags::WAKEUP_BY_CANCEL_REQUEST;
        assert!(should_schedule(cancel_seen, WakeupSource::WaitList));
    }

    #[test]
    fn test_primary_wakeup_source_priority() {
        let flags = SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::WAKEUP_BY_WAIT_LIST;
        assert_eq!(primary_wakeup_source(flags), WakeupSource::WaitList);
        let flags = SleepFlags::WAKEUP_BY_CANCEL_REQUEST | SleepFlags::WAKEUP_BY_DEADLINE_TIMER;
        assert_eq!(primary_wakeup_source(flags), WakeupSource::DeadlineTimer);
        assert_eq!(
            primary_wakeup_source(SleepFlags::WAKEUP_BY_CANCEL_REQUEST),
            WakeupSource::CancelRequest
        );
    }

    struct PublishEpoch {
        current: Arc<TaskContext>,
        published: Arc<Mutex<Option<(Arc<TaskContext>, Epoch)>>>,
    }

    impl WaitStrategy for PublishEpoch {
        fn setup_wakeups(&mut self) -> EarlyWakeup {
            *self.published.lock() = Some((self.current.clone(), self.current.epoch()));
            EarlyWakeup(false)
        }

        fn disable_wakeups(&mut self) {}
    }

    #[test]
    fn test_stale_epoch_wakeup_is_ignored() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let published = Arc::new(Mutex::new(None));
        let resumes = Arc::new(AtomicUsize::new(0));

        let task = {
            let published = published.clone();
            let resumes = resumes.clone();
            processor.spawn(move || {
                current_task::yield_now();
                let current = current_task::context();
                let mut strategy = PublishEpoch {
                    current: current.clone(),
                    published,
                };
                let source = current.sleep(&mut strategy, Deadline::unreachable());
                resumes.fetch_add(1, Ordering::SeqCst);
                source
            })
        };

        let (context, epoch) = loop {
            let ready = published.lock().clone();
            if let Some((context, epoch)) = ready {
                if context.state() == TaskState::Suspended {
                    break (context, epoch);
                }
            }
            std::thread::sleep(Duration::from_millis(1));
        };
        assert!(epoch > Epoch(0));

        context.wakeup(WakeupSource::WaitList, Epoch(epoch.0 - 1));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(context.state(), TaskState::Suspended);
        assert_eq!(resumes.load(Ordering::SeqCst), 0);

        context.wakeup(WakeupSource::WaitList, epoch);
        context.wakeup(WakeupSource::WaitList, epoch);
        assert_eq!(task.get().unwrap(), WakeupSource::WaitList);
        assert_eq!(resumes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_wakeup_after_finish_is_noop() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(current_task::context);
        let context = task.get().unwrap();
        assert_eq!(context.state(), TaskState::Completed);
        let epoch = context.epoch();
        context.wakeup(WakeupSource::WaitList, epoch);
        context.request_cancel(CancellationReason::UserRequest);
        assert_eq!(context.state(), TaskState::Completed);
    }

    fn wait_for_timer_release(context: &Arc<TaskContext>, bound: usize) -> usize {
        let started = Instant::now();
        loop {
            let held = Arc::weak_count(context);
            if held <= bound || started.elapsed() > Duration::from_secs(5) {
                return held;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_early_woken_sleeps_release_timer_entries() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let held = processor
            .spawn(|| {
                let current = current_task::context();
                for _ in 0..1000 {
                    current_task::spawn(|| ())
                        .wait_until(Deadline::from_duration(Duration::from_secs(60)))
                        .unwrap();
                }
                wait_for_timer_release(&current, 2)
            })
            .get()
            .unwrap();
        assert!(held <= 2, "{held} timer entries still reference the task");
    }

    #[test]
    fn test_finished_task_releases_cancel_timer() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let contexts: Vec<_> = (0..100)
            .map(|_| {
                processor
                    .spawn_with_deadline(Deadline::from_duration(Duration::from_secs(3600)), current_task::context)
                    .get()
                    .unwrap()
            })
            .collect();
        for context in &contexts {
            assert_eq!(wait_for_timer_release(context, 0), 0);
        }
    }

    #[test]
    fn test_first_cancellation_reason_wins() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn(|| current_task::interruptible_sleep_for(Duration::from_secs(20)));
        task.request_cancel();
        task.context().request_cancel(CancellationReason::Deadline);
        task.wait().unwrap();
        assert_eq!(task.cancellation_reason(), CancellationReason::UserRequest);
    }
}
