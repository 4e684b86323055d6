//! Wait strategies and context accessors.
//!
//! A [`WaitStrategy`] registers the sleeping task with whatever will wake it
//! and unregisters it afterwards. A [`ContextAccessor`] is an awaitable
//! object (task, future, event) that composite waits can subscribe to.

use std::sync::Arc;

use super::context::TaskContext;

/// Returned by [`WaitStrategy::setup_wakeups`]: `true` when the awaited
/// condition already holds and the task must not go to sleep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EarlyWakeup(pub bool);

/// Registration/unregistration pair around one sleep
pub trait WaitStrategy {
    /// Called before the task suspends. Must not block.
    fn setup_wakeups(&mut self) -> EarlyWakeup;

    /// Called after the task has been resumed, whatever the wakeup source.
    fn disable_wakeups(&mut self);
}

/// Strategy for plain sleeps woken only by deadline or cancellation
pub(crate) struct NoopWaitStrategy;

impl WaitStrategy for NoopWaitStrategy {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {}
}

/// Awaitable object usable with [`wait_any`](super::wait_any)
pub trait ContextAccessor: Sync {
    /// Whether the awaited result is available
    fn is_ready(&self) -> bool;

    /// Subscribe `waiter` to readiness. Returns an early wakeup if the
    /// object is already ready.
    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup;

    /// Undo [`try_append_waiter`](Self::try_append_waiter)
    fn remove_waiter(&self, waiter: &TaskContext);

    /// Hook invoked after the waiter resumed
    fn after_wait(&self) {}
}

/// Waits on several accessors at once; wakes when any becomes ready.
pub(crate) struct AccessorsWaitStrategy<'a> {
    current: &'a Arc<TaskContext>,
    targets: &'a [&'a dyn ContextAccessor],
}

impl<'a> AccessorsWaitStrategy<'a> {
    pub(crate) fn new(current: &'a Arc<TaskContext>, targets: &'a [&'a dyn ContextAccessor]) -> Self {
        Self { current, targets }
    }
}

impl WaitStrategy for AccessorsWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut early = false;
        for target in self.targets {
            if target.try_append_waiter(self.current).0 {
                early = true;
            }
        }
        EarlyWakeup(early)
    }

    fn disable_wakeups(&mut self) {
        for target in self.targets {
            target.remove_waiter(self.current);
        }
    }
}
