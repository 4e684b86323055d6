//! Task-aware producer/consumer queues.
//!
//! A [`GenericQueue`] is shared through an `Arc` and used via handles:
//! [`Producer`] and [`MultiProducer`] push, [`Consumer`] pops. Handles keep
//! the queue alive and track each other's lifetime: once every consumer is
//! gone pushes fail, and once every producer is gone pops drain what is left
//! and then fail instead of blocking.
//!
//! The size limit is soft: several producers racing for the last slot may
//! overrun it slightly. Blocking operations must be called from a task and
//! give up on deadline or cancellation of the calling task.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tracing::trace;

use crate::deadline::Deadline;
use crate::task::{current_task, EarlyWakeup, TaskContext, WaitStrategy};
use crate::wait_list::WaitList;

/// Marks a side whose every handle has been dropped
const CREATED_AND_DEAD: usize = usize::MAX;

/// Limit used when no soft max size is given
pub const UNBOUNDED: usize = usize::MAX / 4;

/// Static shape of a queue: how many producers and consumers it admits and
/// how much of the size limit each element takes.
pub trait QueuePolicy<T>: Send + Sync + 'static {
    /// Several producers may exist at once
    const MULTIPLE_PRODUCERS: bool;
    /// Several consumers may exist at once
    const MULTIPLE_CONSUMERS: bool;

    /// Share of the soft max size taken by `value`
    fn element_size(_value: &T) -> usize {
        1
    }
}

/// Every element counts as one
#[derive(Debug)]
pub struct SimpleQueuePolicy<const MP: bool, const MC: bool>;

impl<T, const MP: bool, const MC: bool> QueuePolicy<T> for SimpleQueuePolicy<MP, MC> {
    const MULTIPLE_PRODUCERS: bool = MP;
    const MULTIPLE_CONSUMERS: bool = MC;
}

/// Single producer, single consumer; strings are counted by byte length
#[derive(Debug)]
pub struct StringStreamPolicy;

impl QueuePolicy<String> for StringStreamPolicy {
    const MULTIPLE_PRODUCERS: bool = false;
    const MULTIPLE_CONSUMERS: bool = false;

    fn element_size(value: &String) -> usize {
        value.len()
    }
}

/// Multiple producers, multiple consumers. Order is kept per producer only.
pub type NonFifoMpmcQueue<T> = GenericQueue<T, SimpleQueuePolicy<true, true>>;
/// Multiple producers, single consumer. Order is kept per producer only.
pub type MpscQueue<T> = GenericQueue<T, SimpleQueuePolicy<true, false>>;
/// Single producer, multiple consumers
pub type SpmcQueue<T> = GenericQueue<T, SimpleQueuePolicy<false, true>>;
/// Single producer, single consumer
pub type SpscQueue<T> = GenericQueue<T, SimpleQueuePolicy<false, false>>;
/// Byte-bounded single producer, single consumer queue of strings
pub type StringStreamQueue = GenericQueue<String, StringStreamPolicy>;

/// Queue shared by producer and consumer handles
pub struct GenericQueue<T, P> {
    items: SegQueue<T>,
    /// Sum of element sizes currently queued
    used: AtomicUsize,
    soft_max_size: AtomicUsize,
    producers: AtomicUsize,
    consumers: AtomicUsize,
    /// Producers waiting for room
    non_full: WaitList,
    /// Consumers waiting for elements
    non_empty: WaitList,
    _policy: PhantomData<fn() -> P>,
}

impl<T: Send, P: QueuePolicy<T>> GenericQueue<T, P> {
    /// Queue with no practical size limit
    pub fn create() -> Arc<Self> {
        Self::with_max_size(UNBOUNDED)
    }

    /// Queue whose pushes block once `max_size` is reached
    pub fn with_max_size(max_size: usize) -> Arc<Self> {
        Arc::new(Self {
            items: SegQueue::new(),
            used: AtomicUsize::new(0),
            soft_max_size: AtomicUsize::new(max_size.min(UNBOUNDED)),
            producers: AtomicUsize::new(0),
            consumers: AtomicUsize::new(0),
            non_full: WaitList::new(),
            non_empty: WaitList::new(),
            _policy: PhantomData,
        })
    }

    /// Handle for pushing from one task or thread at a time.
    ///
    /// A single-producer queue admits only one live producer.
    pub fn get_producer(self: &Arc<Self>) -> Producer<T, P> {
        self.prepare_producer();
        Producer {
            queue: self.clone(),
            _not_sync: PhantomData,
        }
    }

    /// Handle that may be shared between tasks and threads.
    ///
    /// Only available on multi-producer queues.
    pub fn get_multi_producer(self: &Arc<Self>) -> MultiProducer<T, P> {
        uassert!(
            P::MULTIPLE_PRODUCERS,
            "multi-producer handle requested from a single-producer queue"
        );
        self.prepare_producer();
        MultiProducer {
            queue: self.clone(),
        }
    }

    /// Handle for popping.
    ///
    /// A single-consumer queue admits only one live consumer.
    pub fn get_consumer(self: &Arc<Self>) -> Consumer<T, P> {
        let previous = revive_or_increment(&self.consumers);
        uassert!(
            P::MULTIPLE_CONSUMERS || previous == 0 || previous == CREATED_AND_DEAD,
            "second consumer of a single-consumer queue"
        );
        Consumer {
            queue: self.clone(),
            _not_sync: PhantomData,
        }
    }

    /// Change the limit; blocked producers are re-checked
    pub fn set_soft_max_size(&self, max_size: usize) {
        let previous = self
            .soft_max_size
            .swap(max_size.min(UNBOUNDED), Ordering::SeqCst);
        if max_size > previous {
            self.non_full.wakeup_all();
        }
    }

    /// Current limit
    pub fn soft_max_size(&self) -> usize {
        self.soft_max_size.load(Ordering::SeqCst)
    }

    /// Sum of element sizes currently queued
    pub fn size_approximate(&self) -> usize {
        self.used.load(Ordering::SeqCst)
    }

    /// Every consumer was created and dropped
    pub fn no_more_consumers(&self) -> bool {
        self.consumers.load(Ordering::SeqCst) == CREATED_AND_DEAD
    }

    /// Every producer was created and dropped
    pub fn no_more_producers(&self) -> bool {
        self.producers.load(Ordering::SeqCst) == CREATED_AND_DEAD
    }

    fn prepare_producer(&self) {
        let previous = revive_or_increment(&self.producers);
        uassert!(
            P::MULTIPLE_PRODUCERS || previous == 0 || previous == CREATED_AND_DEAD,
            "second producer of a single-producer queue"
        );
    }

    fn mark_producer_dead(&self) {
        if release_handle(&self.producers) {
            trace!("queue lost its last producer");
            self.non_empty.wakeup_all();
        }
    }

    fn mark_consumer_dead(&self) {
        if release_handle(&self.consumers) {
            trace!("queue lost its last consumer");
            self.non_full.wakeup_all();
        }
    }

    fn can_push(&self, size: usize) -> bool {
        self.no_more_consumers()
            || self.used.load(Ordering::SeqCst).saturating_add(size)
                <= self.soft_max_size.load(Ordering::SeqCst)
    }

    fn can_pop(&self) -> bool {
        !self.items.is_empty() || self.no_more_producers()
    }

    fn push_noblock(&self, value: T) -> Result<(), T> {
        if self.no_more_consumers() {
            return Err(value);
        }
        let size = P::element_size(&value);
        let max_size = self.soft_max_size.load(Ordering::SeqCst);
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                let after = used.saturating_add(size);
                (after <= max_size).then_some(after)
            })
            .is_ok();
        if !reserved {
            return Err(value);
        }
        self.items.push(value);
        self.non_empty.wakeup_one();
        Ok(())
    }

    fn push_until(&self, mut value: T, deadline: Deadline) -> Result<(), T> {
        let current = current_task::context();
        let size = P::element_size(&value);
        loop {
            match self.push_noblock(value) {
                Ok(()) => return Ok(()),
                Err(rejected) => value = rejected,
            }
            if self.no_more_consumers() {
                return Err(value);
            }
            let ready = || self.can_push(size);
            let mut strategy = QueueWaitStrategy {
                waiters: &self.non_full,
                current: &current,
                ready: &ready,
            };
            let source = current.sleep(&mut strategy, deadline);
            if !source.has_wait_succeeded() {
                return self.push_noblock(value);
            }
        }
    }

    fn pop_noblock(&self) -> Option<T> {
        let value = self.items.pop()?;
        self.used
            .fetch_sub(P::element_size(&value), Ordering::SeqCst);
        self.non_full.wakeup_one();
        Some(value)
    }

    fn pop_until(&self, deadline: Deadline) -> Option<T> {
        let current = current_task::context();
        loop {
            if let Some(value) = self.pop_noblock() {
                return Some(value);
            }
            if self.no_more_producers() {
                // a producer may have pushed right before dying
                return self.pop_noblock();
            }
            let ready = || self.can_pop();
            let mut strategy = QueueWaitStrategy {
                waiters: &self.non_empty,
                current: &current,
                ready: &ready,
            };
            let source = current.sleep(&mut strategy, deadline);
            if !source.has_wait_succeeded() {
                return self.pop_noblock();
            }
        }
    }
}

/// Take a handle slot, reviving a side whose handles all died
fn revive_or_increment(count: &AtomicUsize) -> usize {
    let result = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
        Some(if count == CREATED_AND_DEAD { 1 } else { count + 1 })
    });
    match result {
        Ok(previous) | Err(previous) => previous,
    }
}

/// Release a handle slot. `true` if it was the last one.
fn release_handle(count: &AtomicUsize) -> bool {
    let result = count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
        Some(if count == 1 { CREATED_AND_DEAD } else { count - 1 })
    });
    matches!(result, Ok(1))
}

struct QueueWaitStrategy<'a> {
    waiters: &'a WaitList,
    current: &'a Arc<TaskContext>,
    ready: &'a dyn Fn() -> bool,
}

impl WaitStrategy for QueueWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        let mut waiters = self.waiters.lock();
        waiters.append(self.current);
        EarlyWakeup((self.ready)())
    }

    fn disable_wakeups(&mut self) {
        self.waiters.remove(self.current);
    }
}

impl<T, P> fmt::Debug for GenericQueue<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenericQueue")
            .field("size", &self.used.load(Ordering::Relaxed))
            .field("soft_max_size", &self.soft_max_size.load(Ordering::Relaxed))
            .field("producers", &self.producers.load(Ordering::Relaxed))
            .field("consumers", &self.consumers.load(Ordering::Relaxed))
            .finish()
    }
}

/// Pushing handle for one task or thread at a time
pub struct Producer<T: Send, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send, P: QueuePolicy<T>> Producer<T, P> {
    /// Push, waiting for room. Returns the value back if every consumer is
    /// gone or the waiting task was cancelled.
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push_until(value, Deadline::unreachable())
    }

    /// [`push`](Self::push) bounded by `deadline`
    pub fn push_until(&self, value: T, deadline: Deadline) -> Result<(), T> {
        self.queue.push_until(value, deadline)
    }

    /// Push only if there is room right now
    pub fn push_noblock(&self, value: T) -> Result<(), T> {
        self.queue.push_noblock(value)
    }

    /// The queue this handle feeds
    pub fn queue(&self) -> &Arc<GenericQueue<T, P>> {
        &self.queue
    }
}

impl<T: Send, P: QueuePolicy<T>> Drop for Producer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_producer_dead();
    }
}

impl<T: Send, P: QueuePolicy<T>> fmt::Debug for Producer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Producer").field("queue", &self.queue).finish()
    }
}

/// Pushing handle usable from several tasks and threads at once
pub struct MultiProducer<T: Send, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
}

impl<T: Send, P: QueuePolicy<T>> MultiProducer<T, P> {
    /// Push, waiting for room
    pub fn push(&self, value: T) -> Result<(), T> {
        self.queue.push_until(value, Deadline::unreachable())
    }

    /// [`push`](Self::push) bounded by `deadline`
    pub fn push_until(&self, value: T, deadline: Deadline) -> Result<(), T> {
        self.queue.push_until(value, deadline)
    }

    /// Push only if there is room right now
    pub fn push_noblock(&self, value: T) -> Result<(), T> {
        self.queue.push_noblock(value)
    }

    /// The queue this handle feeds
    pub fn queue(&self) -> &Arc<GenericQueue<T, P>> {
        &self.queue
    }
}

impl<T: Send, P: QueuePolicy<T>> Drop for MultiProducer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_producer_dead();
    }
}

impl<T: Send, P: QueuePolicy<T>> fmt::Debug for MultiProducer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiProducer")
            .field("queue", &self.queue)
            .finish()
    }
}

/// Popping handle for one task or thread at a time
pub struct Consumer<T: Send, P: QueuePolicy<T>> {
    queue: Arc<GenericQueue<T, P>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Send, P: QueuePolicy<T>> Consumer<T, P> {
    /// Pop, waiting for an element. `None` once the queue is drained and
    /// every producer is gone, or if the waiting task was cancelled.
    pub fn pop(&self) -> Option<T> {
        self.queue.pop_until(Deadline::unreachable())
    }

    /// [`pop`](Self::pop) bounded by `deadline`
    pub fn pop_until(&self, deadline: Deadline) -> Option<T> {
        self.queue.pop_until(deadline)
    }

    /// Pop only if an element is queued
    pub fn pop_noblock(&self) -> Option<T> {
        self.queue.pop_noblock()
    }

    /// The queue this handle drains
    pub fn queue(&self) -> &Arc<GenericQueue<T, P>> {
        &self.queue
    }
}

impl<T: Send, P: QueuePolicy<T>> Drop for Consumer<T, P> {
    fn drop(&mut self) {
        self.queue.mark_consumer_dead();
    }
}

impl<T: Send, P: QueuePolicy<T>> fmt::Debug for Consumer<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer").field("queue", &self.queue).finish()
    }
}
