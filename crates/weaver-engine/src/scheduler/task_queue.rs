//! Task queue selection
//!
//! A processor runs either on one shared queue that every consumer pops from
//! or on the work-stealing queue. The choice is made once from
//! [`TaskQueueType`] and dispatched statically through [`TaskQueue`].

use std::hint;
use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_deque::Worker as LocalQueue;
use parking_lot::{Condvar, Mutex};

use super::global_queue::GlobalQueue;
use super::work_stealing::WorkStealingTaskQueue;
use super::worker::WorkerContext;
use crate::config::TaskQueueType;
use crate::task::TaskContext;

/// Single shared queue; idle consumers sleep on a condition variable
pub(crate) struct GlobalTaskQueue {
    queue: GlobalQueue,
    background: GlobalQueue,
    sleepers: AtomicUsize,
    lock: Mutex<()>,
    wakeup: Condvar,
    stopped: AtomicBool,
    spinning_iterations: usize,
}

impl GlobalTaskQueue {
    pub(crate) fn new(consumers_count: usize, spinning_iterations: usize) -> Self {
        Self {
            queue: GlobalQueue::new(consumers_count),
            background: GlobalQueue::new(consumers_count),
            sleepers: AtomicUsize::new(0),
            lock: Mutex::new(()),
            wakeup: Condvar::new(),
            stopped: AtomicBool::new(false),
            spinning_iterations,
        }
    }

    pub(crate) fn push(&self, context: Arc<TaskContext>) {
        if context.is_background() {
            self.background.push(context);
        } else {
            self.queue.push(context);
        }
        fence(Ordering::SeqCst);
        if self.sleepers.load(Ordering::SeqCst) > 0 {
            let _lock = self.lock.lock();
            self.wakeup.notify_one();
        }
    }

    fn try_pop(&self) -> Option<Arc<TaskContext>> {
        self.queue.try_pop().or_else(|| self.background.try_pop())
    }

    fn has_work(&self) -> bool {
        !self.queue.is_empty() || !self.background.is_empty()
    }

    pub(crate) fn pop_blocking(&self) -> Option<Arc<TaskContext>> {
        loop {
            for _ in 0..=self.spinning_iterations {
                if let Some(context) = self.try_pop() {
                    return Some(context);
                }
                if self.stopped.load(Ordering::SeqCst) {
                    return None;
                }
                hint::spin_loop();
            }

            let mut lock = self.lock.lock();
            self.sleepers.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);
            if !self.has_work() && !self.stopped.load(Ordering::SeqCst) {
                self.wakeup.wait(&mut lock);
            }
            self.sleepers.fetch_sub(1, Ordering::SeqCst);
        }
    }

    pub(crate) fn size_approximate(&self) -> usize {
        self.queue.size_approximate() + self.background.size_approximate()
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let _lock = self.lock.lock();
        self.wakeup.notify_all();
    }

    pub(crate) fn drain(&self) -> Vec<Arc<TaskContext>> {
        let mut drained = self.queue.drain();
        drained.extend(self.background.drain());
        drained
    }
}

impl std::fmt::Debug for GlobalTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalTaskQueue")
            .field("queue", &self.queue)
            .field("sleepers", &self.sleepers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Task queue of one processor
#[derive(Debug)]
pub(crate) enum TaskQueue {
    Global(GlobalTaskQueue),
    WorkStealing(WorkStealingTaskQueue),
}

impl TaskQueue {
    pub(crate) fn new(
        queue_type: TaskQueueType,
        processor_id: u64,
        consumers_count: usize,
        spinning_iterations: usize,
    ) -> Self {
        match queue_type {
            TaskQueueType::GlobalTaskQueue => {
                TaskQueue::Global(GlobalTaskQueue::new(consumers_count, spinning_iterations))
            }
            TaskQueueType::WorkStealingTaskQueue => TaskQueue::WorkStealing(
                WorkStealingTaskQueue::new(processor_id, consumers_count, spinning_iterations),
            ),
        }
    }

    pub(crate) fn queue_type(&self) -> TaskQueueType {
        match self {
            TaskQueue::Global(_) => TaskQueueType::GlobalTaskQueue,
            TaskQueue::WorkStealing(_) => TaskQueueType::WorkStealingTaskQueue,
        }
    }

    /// Local queue for consumer `index`, if the queue type has them
    pub(crate) fn take_local(&self, index: usize) -> Option<LocalQueue<Arc<TaskContext>>> {
        match self {
            TaskQueue::Global(_) => None,
            TaskQueue::WorkStealing(queue) => queue.take_local(index),
        }
    }

    pub(crate) fn push(&self, context: Arc<TaskContext>) {
        match self {
            TaskQueue::Global(queue) => queue.push(context),
            TaskQueue::WorkStealing(queue) => queue.push(context),
        }
    }

    pub(crate) fn pop_blocking(&self, worker: &mut WorkerContext) -> Option<Arc<TaskContext>> {
        match self {
            TaskQueue::Global(queue) => queue.pop_blocking(),
            TaskQueue::WorkStealing(queue) => queue.pop_blocking(worker),
        }
    }

    pub(crate) fn size_approximate(&self) -> usize {
        match self {
            TaskQueue::Global(queue) => queue.size_approximate(),
            TaskQueue::WorkStealing(queue) => queue.size_approximate(),
        }
    }

    /// Wake every consumer and make further pops return `None` once empty
    pub(crate) fn stop(&self) {
        match self {
            TaskQueue::Global(queue) => queue.stop(),
            TaskQueue::WorkStealing(queue) => queue.stop(),
        }
    }

    pub(crate) fn drain(&self) -> Vec<Arc<TaskContext>> {
        match self {
            TaskQueue::Global(queue) => queue.drain(),
            TaskQueue::WorkStealing(queue) => queue.drain(),
        }
    }
}
