//! Wait list for at most one waiter.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use crate::task::{Epoch, TaskContext, WakeupSource};

struct Waiter {
    context: Arc<TaskContext>,
    epoch: Epoch,
}

/// Lock-free wait list holding a single waiting task.
///
/// Appending while another waiter is registered is a programming error and
/// panics in builds with debug assertions.
pub struct WaitListLight {
    waiter: AtomicPtr<Waiter>,
}

impl WaitListLight {
    /// Create an empty wait list
    pub fn new() -> Self {
        Self {
            waiter: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Register `context` for its current sleep epoch
    pub fn append(&self, context: &Arc<TaskContext>) {
        let waiter = Box::into_raw(Box::new(Waiter {
            context: context.clone(),
            epoch: context.epoch(),
        }));
        let installed = self.waiter.compare_exchange(
            ptr::null_mut(),
            waiter,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        if installed.is_err() {
            // SAFETY: `waiter` was never published
            drop(unsafe { Box::from_raw(waiter) });
            uassert!(
                false,
                "WaitListLight already has a waiter, task {} cannot be appended",
                context.id()
            );
        }
    }

    /// Wake the registered waiter, if any
    pub fn wakeup_one(&self) {
        let waiter = self.waiter.swap(ptr::null_mut(), Ordering::SeqCst);
        if waiter.is_null() {
            return;
        }
        // SAFETY: a non-null pointer came from `Box::into_raw` in `append`
        // and the swap transferred its ownership to us
        let waiter = unsafe { Box::from_raw(waiter) };
        waiter
            .context
            .wakeup(WakeupSource::WaitList, waiter.epoch);
    }

    /// Same as [`wakeup_one`](Self::wakeup_one)
    pub fn wakeup_all(&self) {
        self.wakeup_one();
    }

    /// Unregister the waiter. Clears the list unconditionally.
    pub fn remove(&self, context: &TaskContext) {
        let waiter = self.waiter.swap(ptr::null_mut(), Ordering::SeqCst);
        if waiter.is_null() {
            return;
        }
        // SAFETY: see `wakeup_one`
        let waiter = unsafe { Box::from_raw(waiter) };
        uassert!(
            ptr::eq(waiter.context.as_ref(), context),
            "removed waiter {} instead of {}",
            waiter.context.id(),
            context.id()
        );
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.waiter.load(Ordering::SeqCst).is_null()
    }
}

impl Default for WaitListLight {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WaitListLight {
    fn drop(&mut self) {
        let waiter = *self.waiter.get_mut();
        if !waiter.is_null() {
            // SAFETY: exclusive access in drop; see `wakeup_one`
            drop(unsafe { Box::from_raw(waiter) });
        }
    }
}

impl fmt::Debug for WaitListLight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitListLight")
            .field("is_empty", &self.is_empty())
            .finish()
    }
}

// SAFETY: the raw pointer is an owned `Box<Waiter>` and `Waiter` is Send+Sync
unsafe impl Send for WaitListLight {}
unsafe impl Sync for WaitListLight {}
