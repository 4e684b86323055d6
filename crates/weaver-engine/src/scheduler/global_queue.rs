//! Shared task queue with a distributed size counter.

use std::cell::Cell;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use crossbeam_deque::{Injector, Steal};

use crate::task::TaskContext;

/// Upper bound of counter shards
const MAX_COUNTERS: usize = 64;

/// Number of counter shards for a processor with `consumers_count` workers
pub(crate) fn distributed_counters_count(consumers_count: usize) -> usize {
    consumers_count.max(1).next_power_of_two().min(MAX_COUNTERS)
}

thread_local! {
    /// Shard of the calling thread, assigned on first use
    static COUNTER_SHARD: Cell<Option<usize>> = const { Cell::new(None) };
}

fn counter_shard() -> usize {
    static NEXT_SHARD: AtomicUsize = AtomicUsize::new(0);
    COUNTER_SHARD.with(|shard| match shard.get() {
        Some(index) => index,
        None => {
            let index = NEXT_SHARD.fetch_add(1, Ordering::Relaxed);
            shard.set(Some(index));
            index
        }
    })
}

/// Multi-producer multi-consumer task queue.
///
/// Pushes and pops adjust a per-thread counter shard instead of one hot
/// atomic; a single shard may go negative, only the sum is meaningful. The
/// sum is refreshed into `size_approximate` by whichever thread performs
/// every `consumers_count`-th operation.
pub(crate) struct GlobalQueue {
    queue: Injector<Arc<TaskContext>>,
    counters: Vec<CachePadded<AtomicIsize>>,
    consumers_count: usize,
    operations: AtomicUsize,
    size_approximate: AtomicUsize,
}

impl GlobalQueue {
    pub(crate) fn new(consumers_count: usize) -> Self {
        let counters_count = distributed_counters_count(consumers_count);
        Self {
            queue: Injector::new(),
            counters: (0..counters_count)
                .map(|_| CachePadded::new(AtomicIsize::new(0)))
                .collect(),
            consumers_count: consumers_count.max(1),
            operations: AtomicUsize::new(0),
            size_approximate: AtomicUsize::new(0),
        }
    }

    fn counter(&self) -> &AtomicIsize {
        &self.counters[counter_shard() % self.counters.len()]
    }

    pub(crate) fn push(&self, context: Arc<TaskContext>) {
        self.counter().fetch_add(1, Ordering::Relaxed);
        self.queue.push(context);
        self.maybe_refresh_size();
    }

    pub(crate) fn try_pop(&self) -> Option<Arc<TaskContext>> {
        loop {
            match self.queue.steal() {
                Steal::Success(context) => {
                    self.counter().fetch_sub(1, Ordering::Relaxed);
                    self.maybe_refresh_size();
                    return Some(context);
                }
                Steal::Empty => {
                    self.maybe_refresh_size();
                    return None;
                }
                Steal::Retry => continue,
            }
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn maybe_refresh_size(&self) {
        if self.operations.fetch_add(1, Ordering::Relaxed) % self.consumers_count == 0 {
            let total: isize = self
                .counters
                .iter()
                .map(|counter| counter.load(Ordering::Relaxed))
                .sum();
            self.size_approximate
                .store(total.max(0) as usize, Ordering::Relaxed);
        }
    }

    /// Number of queued tasks as of the last refresh
    pub(crate) fn size_approximate(&self) -> usize {
        self.size_approximate.load(Ordering::Relaxed)
    }

    /// Remove every queued task
    pub(crate) fn drain(&self) -> Vec<Arc<TaskContext>> {
        std::iter::from_fn(|| self.try_pop()).collect()
    }
}

impl std::fmt::Debug for GlobalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalQueue")
            .field("counters", &self.counters.len())
            .field("size_approximate", &self.size_approximate())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_count() {
        assert_eq!(distributed_counters_count(0), 1);
        assert_eq!(distributed_counters_count(3), 4);
        assert_eq!(distributed_counters_count(8), 8);
        assert_eq!(distributed_counters_count(1000), MAX_COUNTERS);
    }

    #[test]
    fn test_empty_queue() {
        let queue = GlobalQueue::new(4);
        assert!(queue.is_empty());
        assert!(queue.try_pop().is_none());
        assert_eq!(queue.size_approximate(), 0);
    }
}
