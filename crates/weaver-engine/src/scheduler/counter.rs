//! Task lifecycle counters of one processor.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crossbeam::utils::CachePadded;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
pub(crate) struct TaskCounter {
    created: CachePadded<AtomicU64>,
    finished: CachePadded<AtomicU64>,
    cancelled: AtomicU64,
    overloaded: AtomicU64,
    /// Someone blocks in `wait_idle`
    has_idle_waiter: AtomicBool,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl TaskCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn account_task_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_task_finished(&self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if self.has_idle_waiter.load(Ordering::SeqCst) && self.alive() == 0 {
            let _guard = self.idle_lock.lock();
            self.idle_cv.notify_all();
        }
    }

    pub(crate) fn account_task_cancel(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn account_task_overload(&self) {
        self.overloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub(crate) fn finished(&self) -> u64 {
        self.finished.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub(crate) fn overloaded(&self) -> u64 {
        self.overloaded.load(Ordering::Relaxed)
    }

    /// Tasks created and not yet finished
    pub(crate) fn alive(&self) -> u64 {
        // finished first: a task is always created before it finishes
        let finished = self.finished();
        self.created().saturating_sub(finished)
    }

    /// Block until no task is alive. `on_slow` runs once if that takes
    /// longer than `slow_after`.
    pub(crate) fn wait_idle(&self, slow_after: Duration, on_slow: impl FnOnce(u64)) {
        self.has_idle_waiter.store(true, Ordering::SeqCst);
        let mut on_slow = Some(on_slow);
        let mut guard = self.idle_lock.lock();
        while self.alive() > 0 {
            let timed_out = self.idle_cv.wait_for(&mut guard, slow_after).timed_out();
            if timed_out {
                if let Some(report) = on_slow.take() {
                    report(self.alive());
                }
            }
        }
        drop(guard);
        self.has_idle_waiter.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alive_count() {
        let counter = TaskCounter::new();
        counter.account_task_created();
        counter.account_task_created();
        counter.account_task_finished();
        counter.account_task_cancel();
        assert_eq!(counter.created(), 2);
        assert_eq!(counter.finished(), 1);
        assert_eq!(counter.alive(), 1);
        assert_eq!(counter.cancelled(), 1);
        assert_eq!(counter.overloaded(), 0);
    }

    #[test]
    fn test_wait_idle_wakes_on_last_finish() {
        let counter = std::sync::Arc::new(TaskCounter::new());
        for _ in 0..3 {
            counter.account_task_created();
        }
        let finisher = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                for _ in 0..3 {
                    std::thread::sleep(Duration::from_millis(5));
                    counter.account_task_finished();
                }
            })
        };
        let mut slow = false;
        counter.wait_idle(Duration::from_secs(30), |_| slow = true);
        assert_eq!(counter.alive(), 0);
        assert!(!slow);
        finisher.join().unwrap();
    }

    #[test]
    fn test_wait_idle_reports_slow_shutdown() {
        let counter = std::sync::Arc::new(TaskCounter::new());
        counter.account_task_created();
        let finisher = {
            let counter = counter.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                counter.account_task_finished();
            })
        };
        let mut reported = None;
        counter.wait_idle(Duration::from_millis(5), |alive| reported = Some(alive));
        assert_eq!(reported, Some(1));
        finisher.join().unwrap();
    }
}
