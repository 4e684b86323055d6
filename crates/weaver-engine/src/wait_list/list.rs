//! Multi-waiter wait list guarded by a short critical section.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::task::{Epoch, TaskContext, WakeupSource};

struct Waiter {
    context: Arc<TaskContext>,
    epoch: Epoch,
}

/// Wait list for any number of waiters.
///
/// No wakeup order is guaranteed.
pub struct WaitList {
    waiters: Mutex<VecDeque<Waiter>>,
}

/// Exclusive access to a [`WaitList`]. Never held across a suspension.
pub struct WaitListLock<'a> {
    waiters: MutexGuard<'a, VecDeque<Waiter>>,
}

impl WaitList {
    /// Create an empty wait list
    pub fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Lock the list
    pub fn lock(&self) -> WaitListLock<'_> {
        WaitListLock {
            waiters: self.waiters.lock(),
        }
    }

    /// Lock, append, unlock
    pub fn append(&self, context: &Arc<TaskContext>) {
        self.lock().append(context);
    }

    /// Lock, remove, unlock
    pub fn remove(&self, context: &TaskContext) {
        self.lock().remove(context);
    }

    /// Lock, wake one waiter, unlock
    pub fn wakeup_one(&self) {
        self.lock().wakeup_one();
    }

    /// Lock, wake every waiter, unlock
    pub fn wakeup_all(&self) {
        self.lock().wakeup_all();
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

impl<'a> WaitListLock<'a> {
    /// Register `context` for its current sleep epoch
    pub fn append(&mut self, context: &Arc<TaskContext>) {
        self.waiters.push_back(Waiter {
            context: context.clone(),
            epoch: context.epoch(),
        });
    }

    /// Unregister `context` if it is still listed
    pub fn remove(&mut self, context: &TaskContext) {
        if let Some(pos) = self
            .waiters
            .iter()
            .position(|waiter| std::ptr::eq(waiter.context.as_ref(), context))
        {
            self.waiters.swap_remove_back(pos);
        }
    }

    /// Wake and detach one waiter
    pub fn wakeup_one(&mut self) {
        if let Some(waiter) = self.waiters.pop_front() {
            waiter
                .context
                .wakeup(WakeupSource::WaitList, waiter.epoch);
        }
    }

    /// Wake and detach every waiter
    pub fn wakeup_all(&mut self) {
        for waiter in self.waiters.drain(..) {
            waiter
                .context
                .wakeup(WakeupSource::WaitList, waiter.epoch);
        }
    }

    /// Whether no task is registered
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    /// Number of registered waiters
    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

impl Default for WaitList {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitList")
            .field("waiters", &self.waiters.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use crate::task::current_task;

    #[test]
    fn test_append_remove() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let first = processor.spawn(current_task::context).get().unwrap();
        let second = processor.spawn(current_task::context).get().unwrap();

        let list = WaitList::new();
        {
            let mut lock = list.lock();
            lock.append(&first);
            lock.append(&second);
            assert_eq!(lock.len(), 2);
            lock.remove(&first);
            assert_eq!(lock.len(), 1);
            lock.remove(&first);
            assert_eq!(lock.len(), 1);
        }
        list.wakeup_all();
        assert!(list.is_empty());
    }

    #[test]
    fn test_wakeup_one_detaches_single_waiter() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let first = processor.spawn(current_task::context).get().unwrap();
        let second = processor.spawn(current_task::context).get().unwrap();

        let list = WaitList::new();
        list.append(&first);
        list.append(&second);
        list.wakeup_one();
        assert_eq!(list.lock().len(), 1);
        list.wakeup_one();
        assert!(list.is_empty());
    }
}
