//! Counting semaphores for tasks.
//!
//! [`Semaphore`] waits ignore cancellation; [`CancellableSemaphore`] waits
//! are interrupted by it. Locking more units than the capacity can never
//! succeed and fails immediately.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::task::{current_task, CancellationReason, EarlyWakeup, TaskContext, WaitStrategy};
use crate::wait_list::WaitList;

/// Semaphore locking failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SemaphoreError {
    /// More units requested than the semaphore can ever provide
    #[error("cannot lock {requested} units of a semaphore with capacity {capacity}")]
    Unreachable {
        /// Requested units
        requested: usize,
        /// Capacity at the time of the request
        capacity: usize,
    },

    /// The waiting task was cancelled
    #[error("semaphore wait cancelled: {0}")]
    Cancelled(CancellationReason),
}

/// Outcome of a single acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TryLockStatus {
    Success,
    TransientFailure,
    PermanentFailure,
}

struct SemaphoreCore {
    capacity: AtomicUsize,
    acquired: AtomicUsize,
    waiters: WaitList,
}

impl SemaphoreCore {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: AtomicUsize::new(capacity),
            acquired: AtomicUsize::new(0),
            waiters: WaitList::new(),
        }
    }

    fn try_lock(&self, count: usize) -> TryLockStatus {
        let mut acquired = self.acquired.load(Ordering::SeqCst);
        loop {
            let capacity = self.capacity.load(Ordering::SeqCst);
            if count > capacity {
                return TryLockStatus::PermanentFailure;
            }
            match acquired.checked_add(count) {
                Some(total) if total <= capacity => {}
                _ => return TryLockStatus::TransientFailure,
            }
            match self.acquired.compare_exchange_weak(
                acquired,
                acquired + count,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return TryLockStatus::Success,
                Err(actual) => acquired = actual,
            }
        }
    }

    fn can_lock(&self, count: usize) -> bool {
        let capacity = self.capacity.load(Ordering::SeqCst);
        let acquired = self.acquired.load(Ordering::SeqCst);
        count > capacity || acquired.saturating_add(count) <= capacity
    }

    /// Blocking acquisition; `PermanentFailure` is reported without waiting
    fn lock_until(&self, count: usize, deadline: Deadline, cancellable: bool) -> Result<(), LockFailure> {
        match self.try_lock(count) {
            TryLockStatus::Success => return Ok(()),
            TryLockStatus::PermanentFailure => return Err(LockFailure::Unreachable),
            TryLockStatus::TransientFailure => {}
        }
        let current = current_task::context();
        let _blocker = (!cancellable).then(current_task::CancellationBlocker::new);
        loop {
            let mut strategy = SemaphoreWaitStrategy {
                core: self,
                current: &current,
                count,
            };
            let source = current.sleep(&mut strategy, deadline);
            match self.try_lock(count) {
                TryLockStatus::Success => return Ok(()),
                TryLockStatus::PermanentFailure => return Err(LockFailure::Unreachable),
                TryLockStatus::TransientFailure => {}
            }
            if !source.has_wait_succeeded() {
                return Err(if current.should_cancel() {
                    LockFailure::Cancelled(current.cancellation_reason())
                } else {
                    LockFailure::Timeout
                });
            }
        }
    }

    fn unlock(&self, count: usize) {
        let previous = self.acquired.fetch_sub(count, Ordering::SeqCst);
        uassert!(
            previous >= count,
            "semaphore released {} units while only {} were locked",
            count,
            previous
        );
        self.waiters.wakeup_all();
    }

    fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::SeqCst);
        self.waiters.wakeup_all();
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    fn remaining_approx(&self) -> usize {
        self.capacity()
            .saturating_sub(self.acquired.load(Ordering::Relaxed))
    }

    fn used_approx(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }
}

enum LockFailure {
    Unreachable,
    Timeout,
    Cancelled(CancellationReason),
}

struct SemaphoreWaitStrategy<'a> {
    core: &'a SemaphoreCore,
    current: &'a Arc<TaskContext>,
    count: usize,
}

impl WaitStrategy for SemaphoreWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.core.waiters.lock();
        waiters.append(self.current);
        EarlyWakeup(self.core.can_lock(self.count))
    }

    fn disable_wakeups(&mut self) {
        self.core.waiters.remove(self.current);
    }
}

macro_rules! semaphore_api {
    ($name:ident, $cancellable:expr) => {
        impl $name {
            /// Create a semaphore with `capacity` units
            pub fn new(capacity: usize) -> Self {
                Self {
                    core: SemaphoreCore::new(capacity),
                }
            }

            /// Lock one unit, waiting as long as needed
            pub fn lock_shared(&self) -> Result<(), SemaphoreError> {
                self.lock_shared_count(1)
            }

            /// Lock `count` units, waiting as long as needed
            pub fn lock_shared_count(&self, count: usize) -> Result<(), SemaphoreError> {
                self.core
                    .lock_until(count, Deadline::unreachable(), $cancellable)
                    .map_err(|failure| self.to_error(failure, count))
            }

            /// Lock one unit without waiting
            pub fn try_lock_shared(&self) -> bool {
                self.try_lock_shared_count(1)
            }

            /// Lock `count` units without waiting
            pub fn try_lock_shared_count(&self, count: usize) -> bool {
                self.core.try_lock(count) == TryLockStatus::Success
            }

            /// Lock one unit, waiting until `deadline`
            pub fn try_lock_shared_until(&self, deadline: Deadline) -> bool {
                self.try_lock_shared_until_count(deadline, 1)
            }

            /// Lock `count` units, waiting until `deadline`
            pub fn try_lock_shared_until_count(&self, deadline: Deadline, count: usize) -> bool {
                self.core.lock_until(count, deadline, $cancellable).is_ok()
            }

            /// Release one unit
            pub fn unlock_shared(&self) {
                self.core.unlock(1);
            }

            /// Release `count` units
            pub fn unlock_shared_count(&self, count: usize) {
                self.core.unlock(count);
            }

            /// Change the capacity; waiters re-check their requests
            pub fn set_capacity(&self, capacity: usize) {
                self.core.set_capacity(capacity);
            }

            /// Current capacity
            pub fn capacity(&self) -> usize {
                self.core.capacity()
            }

            /// Units that can be locked right now
            pub fn remaining_approx(&self) -> usize {
                self.core.remaining_approx()
            }

            /// Units currently locked
            pub fn used_approx(&self) -> usize {
                self.core.used_approx()
            }

            fn to_error(&self, failure: LockFailure, count: usize) -> SemaphoreError {
                match failure {
                    LockFailure::Cancelled(reason) => SemaphoreError::Cancelled(reason),
                    LockFailure::Unreachable | LockFailure::Timeout => SemaphoreError::Unreachable {
                        requested: count,
                        capacity: self.core.capacity(),
                    },
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("capacity", &self.capacity())
                    .field("used", &self.used_approx())
                    .finish()
            }
        }
    };
}

/// Counting semaphore whose waits ignore cancellation
pub struct Semaphore {
    core: SemaphoreCore,
}

semaphore_api!(Semaphore, false);

impl Semaphore {
    /// Lock one unit and release it when the guard is dropped
    pub fn acquire(&self) -> Result<SemaphoreGuard<'_>, SemaphoreError> {
        self.lock_shared()?;
        Ok(SemaphoreGuard {
            semaphore: self,
            count: 1,
        })
    }
}

/// Counting semaphore whose waits are interrupted by cancellation
pub struct CancellableSemaphore {
    core: SemaphoreCore,
}

semaphore_api!(CancellableSemaphore, true);

/// RAII guard over units of a [`Semaphore`]
pub struct SemaphoreGuard<'a> {
    semaphore: &'a Semaphore,
    count: usize,
}

impl Drop for SemaphoreGuard<'_> {
    fn drop(&mut self) {
        self.semaphore.unlock_shared_count(self.count);
    }
}
