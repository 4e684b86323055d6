//! Sleep/wake coordination of the consumers of a work-stealing processor.
//!
//! The numbers of sleeping and stealing consumers are packed into one atomic
//! word so that a producer decides with a single load whether a sleeping
//! consumer must be woken.

use std::collections::VecDeque;
use std::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

const STEALING_MASK: u64 = 0xFFFF_FFFF;
const SLEEPING_SHIFT: u32 = 32;

/// Snapshot of the packed consumers state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ConsumersState {
    pub(crate) sleeping: u32,
    pub(crate) stealing: u32,
}

impl ConsumersState {
    fn unpack(raw: u64) -> Self {
        Self {
            sleeping: (raw >> SLEEPING_SHIFT) as u32,
            stealing: (raw & STEALING_MASK) as u32,
        }
    }
}

/// Binary semaphore a single consumer sleeps on
#[derive(Default)]
struct Parker {
    notified: Mutex<bool>,
    condvar: Condvar,
}

impl Parker {
    fn park(&self) {
        let mut notified = self.notified.lock();
        while !*notified {
            self.condvar.wait(&mut notified);
        }
        *notified = false;
    }

    fn unpark(&self) {
        let mut notified = self.notified.lock();
        *notified = true;
        self.condvar.notify_one();
    }
}

/// Tracks sleeping and stealing consumers
pub(crate) struct ConsumersManager {
    consumers_count: usize,
    state: AtomicU64,
    /// Indices of sleeping consumers, in the order they went to sleep
    sleepers: Mutex<VecDeque<usize>>,
    parkers: Vec<Parker>,
    stopped: AtomicBool,
}

impl ConsumersManager {
    pub(crate) fn new(consumers_count: usize) -> Self {
        Self {
            consumers_count,
            state: AtomicU64::new(0),
            sleepers: Mutex::new(VecDeque::with_capacity(consumers_count)),
            parkers: (0..consumers_count).map(|_| Parker::default()).collect(),
            stopped: AtomicBool::new(false),
        }
    }

    pub(crate) fn state(&self) -> ConsumersState {
        ConsumersState::unpack(self.state.load(Ordering::SeqCst))
    }

    /// Called after a task was pushed
    pub(crate) fn notify_new_task(&self) {
        fence(Ordering::SeqCst);
        let state = self.state();
        if state.sleeping > 0 && state.stealing == 0 {
            self.wake_up_one();
        }
    }

    /// Register the caller as a stealing consumer if few enough already are
    pub(crate) fn allow_stealing(&self) -> bool {
        let mut raw = self.state.load(Ordering::SeqCst);
        loop {
            let state = ConsumersState::unpack(raw);
            if (state.stealing as usize) * 2 >= self.consumers_count {
                return false;
            }
            match self.state.compare_exchange_weak(
                raw,
                raw + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => raw = actual,
            }
        }
    }

    /// Undo a successful [`allow_stealing`](Self::allow_stealing)
    pub(crate) fn stop_stealing(&self) {
        let previous = self.state.fetch_sub(1, Ordering::SeqCst);
        uassert!(
            previous & STEALING_MASK > 0,
            "stop_stealing without a stealing consumer"
        );
    }

    /// Put consumer `index` to sleep unless `has_work` reports pending work
    /// after the consumer became visible as sleeping.
    pub(crate) fn sleep(&self, index: usize, has_work: impl Fn() -> bool) {
        {
            let mut sleepers = self.sleepers.lock();
            sleepers.push_back(index);
            self.state.fetch_add(1 << SLEEPING_SHIFT, Ordering::SeqCst);
        }
        fence(Ordering::SeqCst);

        if has_work() || self.stopped.load(Ordering::SeqCst) {
            let mut sleepers = self.sleepers.lock();
            if let Some(position) = sleepers.iter().position(|&sleeper| sleeper == index) {
                sleepers.remove(position);
                self.state.fetch_sub(1 << SLEEPING_SHIFT, Ordering::SeqCst);
                return;
            }
            // a producer already took us off the list and is about to unpark
        }

        trace!(consumer = index, "consumer sleeping");
        self.parkers[index].park();
    }

    fn wake_up_one(&self) {
        let woken = {
            let mut sleepers = self.sleepers.lock();
            let woken = sleepers.pop_front();
            if woken.is_some() {
                self.state.fetch_sub(1 << SLEEPING_SHIFT, Ordering::SeqCst);
            }
            woken
        };
        if let Some(index) = woken {
            trace!(consumer = index, "waking consumer");
            self.parkers[index].unpark();
        }
    }

    /// Wake every sleeping consumer
    pub(crate) fn wake_up_all(&self) {
        let woken: Vec<usize> = {
            let mut sleepers = self.sleepers.lock();
            let woken: Vec<usize> = sleepers.drain(..).collect();
            self.state
                .fetch_sub((woken.len() as u64) << SLEEPING_SHIFT, Ordering::SeqCst);
            woken
        };
        for index in woken {
            self.parkers[index].unpark();
        }
    }

    /// Make every current and future sleep return immediately
    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.wake_up_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConsumersManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumersManager")
            .field("consumers_count", &self.consumers_count)
            .field("state", &self.state())
            .finish()
    }
}
