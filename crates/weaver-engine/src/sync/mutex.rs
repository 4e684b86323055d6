//! Task-aware mutex.
//!
//! Waiting for the lock suspends the task instead of blocking its worker.
//! Lock waits ignore cancellation: a cancelled task still obtains the lock
//! and leaves the protected data consistent.

use std::cell::UnsafeCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::task::{current_task, EarlyWakeup, TaskContext, WaitStrategy};
use crate::wait_list::WaitList;

const UNLOCKED: u64 = 0;
/// Owner id used for locks taken outside of tasks
const FOREIGN_OWNER: u64 = u64::MAX;

/// Mutual exclusion for data shared between tasks
pub struct Mutex<T: ?Sized> {
    /// Id of the owning task, [`UNLOCKED`] if free
    owner: AtomicU64,
    waiters: WaitList,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

/// Lock on a [`Mutex`], released when dropped
#[must_use = "the mutex is unlocked as soon as the guard is dropped"]
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

unsafe impl<T: ?Sized + Sync> Sync for MutexGuard<'_, T> {}

fn current_owner_id() -> u64 {
    current_task::task_id().map_or(FOREIGN_OWNER, |id| id.as_u64())
}

impl<T> Mutex<T> {
    /// Create an unlocked mutex
    pub fn new(value: T) -> Self {
        Self {
            owner: AtomicU64::new(UNLOCKED),
            waiters: WaitList::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Consume the mutex and return the protected value
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Lock the mutex, suspending the current task until it is free.
    ///
    /// Must be called from a task. Locking a mutex the task already holds
    /// is an error.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.lock_raw();
        MutexGuard { mutex: self }
    }

    /// Lock the mutex if it is free
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.try_lock_raw(current_owner_id())
            .then(|| MutexGuard { mutex: self })
    }

    /// Lock the mutex, waiting until `deadline` at most
    pub fn try_lock_until(&self, deadline: Deadline) -> Option<MutexGuard<'_, T>> {
        self.lock_until_raw(deadline)
            .then(|| MutexGuard { mutex: self })
    }

    /// Mutable access without locking; the borrow proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Whether some task holds the lock right now
    pub fn is_locked(&self) -> bool {
        self.owner.load(Ordering::SeqCst) != UNLOCKED
    }

    fn try_lock_raw(&self, owner: u64) -> bool {
        self.owner
            .compare_exchange(UNLOCKED, owner, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn lock_raw(&self) {
        let locked = self.lock_until_raw(Deadline::unreachable());
        uassert!(locked, "mutex wait without a deadline gave up");
    }

    fn lock_until_raw(&self, deadline: Deadline) -> bool {
        let current = current_task::context();
        let owner = current.id().as_u64();
        if self.try_lock_raw(owner) {
            return true;
        }
        uassert!(
            self.owner.load(Ordering::SeqCst) != owner,
            "task {} locks a mutex it already holds",
            current.id()
        );

        let _blocker = current_task::CancellationBlocker::new();
        loop {
            let mut strategy = MutexWaitStrategy {
                mutex: self,
                current: &current,
            };
            let source = current.sleep(&mut strategy, deadline);
            if self.try_lock_raw(owner) {
                return true;
            }
            if !source.has_wait_succeeded() {
                // the wakeup meant for us may have been consumed; pass it on
                if !self.is_locked() {
                    self.waiters.wakeup_one();
                }
                return false;
            }
        }
    }

    pub(crate) fn unlock_raw(&self) {
        let previous = self.owner.swap(UNLOCKED, Ordering::SeqCst);
        uassert!(previous != UNLOCKED, "unlock of a mutex that is not locked");
        self.waiters.wakeup_one();
    }
}

struct MutexWaitStrategy<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    current: &'a Arc<TaskContext>,
}

impl<T: ?Sized> WaitStrategy for MutexWaitStrategy<'_, T> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.mutex.waiters.lock();
        waiters.append(self.current);
        EarlyWakeup(!self.mutex.is_locked())
    }

    fn disable_wakeups(&mut self) {
        self.mutex.waiters.remove(self.current);
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held exclusively
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.unlock_raw();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for MutexGuard<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
