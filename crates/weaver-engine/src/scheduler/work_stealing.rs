//! Work-stealing task queue
//!
//! Every consumer owns a FIFO local queue. Tasks scheduled by code running on
//! a consumer of the same processor go to that consumer's local queue, all
//! other tasks go to the shared global queue, background tasks to the
//! background queue. An idle consumer looks at its local queue, then the
//! global queue, then steals half of a random peer's local queue, and only
//! then takes background work.

use std::hint;
use std::sync::Arc;

use crossbeam_deque::{Stealer, Worker as LocalQueue};
use parking_lot::Mutex;
use rand::Rng;

use super::consumers::ConsumersManager;
use super::global_queue::GlobalQueue;
use super::worker::{self, WorkerContext};
use crate::task::TaskContext;

/// Every this many pop attempts the global queue is checked before the
/// local one, so that a consumer busy with local work still drains it
const GLOBAL_QUEUE_CHECK_PERIOD: u64 = 61;

pub(crate) struct WorkStealingTaskQueue {
    processor_id: u64,
    global: GlobalQueue,
    background: GlobalQueue,
    stealers: Vec<Stealer<Arc<TaskContext>>>,
    /// Local queues until their consumers pick them up
    locals: Mutex<Vec<Option<LocalQueue<Arc<TaskContext>>>>>,
    consumers: ConsumersManager,
    spinning_iterations: usize,
}

impl WorkStealingTaskQueue {
    pub(crate) fn new(processor_id: u64, consumers_count: usize, spinning_iterations: usize) -> Self {
        let locals: Vec<LocalQueue<Arc<TaskContext>>> =
            (0..consumers_count).map(|_| LocalQueue::new_fifo()).collect();
        let stealers = locals.iter().map(LocalQueue::stealer).collect();
        Self {
            processor_id,
            global: GlobalQueue::new(consumers_count),
            background: GlobalQueue::new(consumers_count),
            stealers,
            locals: Mutex::new(locals.into_iter().map(Some).collect()),
            consumers: ConsumersManager::new(consumers_count),
            spinning_iterations,
        }
    }

    /// Hand the local queue of consumer `index` to its thread
    pub(crate) fn take_local(&self, index: usize) -> Option<LocalQueue<Arc<TaskContext>>> {
        self.locals.lock().get_mut(index).and_then(Option::take)
    }

    pub(crate) fn push(&self, context: Arc<TaskContext>) {
        if context.is_background() {
            self.background.push(context);
        } else {
            let processor_id = self.processor_id;
            let rest = worker::with_current(move |worker| match worker {
                Some(WorkerContext {
                    processor_id: id,
                    local: Some(local),
                    ..
                }) if *id == processor_id => {
                    local.push(context);
                    None
                }
                _ => Some(context),
            });
            if let Some(context) = rest {
                self.global.push(context);
            }
        }
        self.consumers.notify_new_task();
    }

    /// Pop a task for `worker`, sleeping while there is none.
    ///
    /// Returns `None` once the queue is stopped and nothing is left for the
    /// caller to run.
    pub(crate) fn pop_blocking(&self, worker: &mut WorkerContext) -> Option<Arc<TaskContext>> {
        loop {
            for _ in 0..=self.spinning_iterations {
                if let Some(context) = self.try_pop(worker) {
                    return Some(context);
                }
                if self.consumers.is_stopped() {
                    return None;
                }
                hint::spin_loop();
            }
            self.consumers.sleep(worker.index, || self.has_work());
        }
    }

    fn try_pop(&self, worker: &mut WorkerContext) -> Option<Arc<TaskContext>> {
        worker.pops = worker.pops.wrapping_add(1);
        if worker.pops % GLOBAL_QUEUE_CHECK_PERIOD == 0 {
            if let Some(context) = self.global.try_pop() {
                return Some(context);
            }
        }
        if let Some(context) = worker.local.as_ref().and_then(LocalQueue::pop) {
            return Some(context);
        }
        if let Some(context) = self.global.try_pop() {
            return Some(context);
        }
        if let Some(context) = self.try_steal(worker) {
            return Some(context);
        }
        self.background.try_pop()
    }

    fn try_steal(&self, worker: &WorkerContext) -> Option<Arc<TaskContext>> {
        let count = self.stealers.len();
        if count < 2 || !self.consumers.allow_stealing() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..count);
        let mut found = None;
        for offset in 0..count {
            let victim = (start + offset) % count;
            if victim == worker.index {
                continue;
            }
            let stealer = &self.stealers[victim];
            found = std::iter::repeat_with(|| match &worker.local {
                Some(local) => stealer.steal_batch_and_pop(local),
                None => stealer.steal(),
            })
            .find(|steal| !steal.is_retry())
            .and_then(|steal| steal.success());
            if found.is_some() {
                break;
            }
        }
        self.consumers.stop_stealing();
        if found.is_some() && worker.local.as_ref().is_some_and(|local| !local.is_empty()) {
            // the stolen batch is visible to other idle consumers now
            self.consumers.notify_new_task();
        }
        found
    }

    fn has_work(&self) -> bool {
        !self.global.is_empty()
            || !self.background.is_empty()
            || self.stealers.iter().any(|stealer| !stealer.is_empty())
    }

    pub(crate) fn size_approximate(&self) -> usize {
        self.global.size_approximate()
            + self.background.size_approximate()
            + self.stealers.iter().map(Stealer::len).sum::<usize>()
    }

    pub(crate) fn stop(&self) {
        self.consumers.stop();
    }

    /// Remove tasks left in the shared queues
    pub(crate) fn drain(&self) -> Vec<Arc<TaskContext>> {
        let mut drained = self.global.drain();
        drained.extend(self.background.drain());
        drained
    }
}

impl std::fmt::Debug for WorkStealingTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingTaskQueue")
            .field("global", &self.global)
            .field("consumers", &self.consumers)
            .finish()
    }
}
