//! Condition variable for [`Mutex`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::mutex::{Mutex, MutexGuard};
use crate::deadline::Deadline;
use crate::task::{current_task, EarlyWakeup, TaskContext, WaitStrategy, WakeupSource};
use crate::wait_list::WaitList;

/// How a condition variable wait ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CvStatus {
    /// Woken by a notification
    NoTimeout,
    /// The deadline expired
    Timeout,
    /// The waiting task was cancelled
    Cancelled,
}

/// Lets tasks wait for a condition over data protected by a [`Mutex`].
///
/// Waits are cancellable. Notifications are not remembered: only tasks
/// already waiting are woken.
pub struct ConditionVariable {
    waiters: WaitList,
}

impl ConditionVariable {
    /// Create a condition variable with no waiters
    pub fn new() -> Self {
        Self {
            waiters: WaitList::new(),
        }
    }

    /// Release the lock, wait for a notification and lock again
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> CvStatus {
        self.wait_until(guard, Deadline::unreachable())
    }

    /// [`wait`](Self::wait) bounded by `timeout`
    pub fn wait_for<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, timeout: Duration) -> CvStatus {
        self.wait_until(guard, Deadline::from_duration(timeout))
    }

    /// [`wait`](Self::wait) bounded by `deadline`
    pub fn wait_until<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>, deadline: Deadline) -> CvStatus {
        let current = current_task::context();
        let mutex = guard.mutex();
        let mut strategy = CvWaitStrategy {
            cv: self,
            mutex,
            current: &current,
            unlocked: false,
        };
        let source = current.sleep(&mut strategy, deadline);
        if strategy.unlocked {
            mutex.lock_raw();
        }
        match source {
            WakeupSource::WaitList | WakeupSource::Bootstrap => CvStatus::NoTimeout,
            WakeupSource::DeadlineTimer => CvStatus::Timeout,
            WakeupSource::CancelRequest | WakeupSource::None => CvStatus::Cancelled,
        }
    }

    /// Wait until `predicate` holds. Returns the final value of the
    /// predicate, `false` only if the wait was cancelled.
    pub fn wait_pred<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> bool {
        self.wait_until_pred(guard, Deadline::unreachable(), predicate)
    }

    /// Wait until `predicate` holds or `timeout` passes
    pub fn wait_for_pred<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
        predicate: impl FnMut(&mut T) -> bool,
    ) -> bool {
        self.wait_until_pred(guard, Deadline::from_duration(timeout), predicate)
    }

    /// Wait until `predicate` holds or `deadline` expires
    pub fn wait_until_pred<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        deadline: Deadline,
        mut predicate: impl FnMut(&mut T) -> bool,
    ) -> bool {
        while !predicate(&mut **guard) {
            if self.wait_until(guard, deadline) != CvStatus::NoTimeout {
                return predicate(&mut **guard);
            }
        }
        true
    }

    /// Wake one waiting task
    pub fn notify_one(&self) {
        self.waiters.wakeup_one();
    }

    /// Wake every waiting task
    pub fn notify_all(&self) {
        self.waiters.wakeup_all();
    }
}

struct CvWaitStrategy<'a, T: ?Sized> {
    cv: &'a ConditionVariable,
    mutex: &'a Mutex<T>,
    current: &'a Arc<TaskContext>,
    /// Whether the mutex was released and must be locked again
    unlocked: bool,
}

impl<T: ?Sized> WaitStrategy for CvWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        // register before unlocking, so a notify under the lock is never lost
        self.cv.waiters.append(self.current);
        self.mutex.unlock_raw();
        self.unlocked = true;
        EarlyWakeup(false)
    }

    fn disable_wakeups(&mut self) {
        self.cv.waiters.remove(self.current);
    }
}

impl Default for ConditionVariable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ConditionVariable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionVariable")
            .field("waiters", &self.waiters)
            .finish()
    }
}
