//! One-shot event with at most one waiter.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::task::{current_task, AccessorsWaitStrategy, ContextAccessor, EarlyWakeup, TaskContext};
use crate::wait_list::WaitListLight;

/// Event that is sent exactly once and awaited by at most one task.
///
/// Waiting is not interrupted by cancellation.
pub struct SingleUseEvent {
    is_sent: AtomicBool,
    waiters: WaitListLight,
}

impl SingleUseEvent {
    /// Create an unsent event
    pub fn new() -> Self {
        Self {
            is_sent: AtomicBool::new(false),
            waiters: WaitListLight::new(),
        }
    }

    /// Wait until the event is sent, ignoring cancellation
    pub fn wait_non_cancellable(&self) {
        if self.is_ready() {
            return;
        }
        let current = current_task::context();
        let _blocker = current_task::CancellationBlocker::new();
        let targets: [&dyn ContextAccessor; 1] = [self];
        while !self.is_ready() {
            let mut strategy = AccessorsWaitStrategy::new(&current, &targets);
            current.sleep(&mut strategy, Deadline::unreachable());
        }
    }

    /// Send the event. Must be called at most once.
    pub fn send(&self) {
        let was_sent = self.is_sent.swap(true, Ordering::SeqCst);
        uassert!(!was_sent, "SingleUseEvent sent twice");
        self.waiters.wakeup_one();
    }

    /// Whether the event has been sent
    pub fn is_ready(&self) -> bool {
        self.is_sent.load(Ordering::SeqCst)
    }
}

impl ContextAccessor for SingleUseEvent {
    fn is_ready(&self) -> bool {
        SingleUseEvent::is_ready(self)
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.waiters.append(waiter);
        EarlyWakeup(self.is_ready())
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.waiters.remove(waiter);
    }
}

impl Default for SingleUseEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleUseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleUseEvent")
            .field("is_sent", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use std::time::Duration;

    #[test]
    fn test_wait_after_send() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let event = Arc::new(SingleUseEvent::new());
        event.send();
        let waiter = event.clone();
        processor
            .spawn(move || waiter.wait_non_cancellable())
            .get()
            .unwrap();
        assert!(event.is_ready());
    }

    #[test]
    fn test_wait_ignores_cancellation() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let event = Arc::new(SingleUseEvent::new());
        let waiter = event.clone();
        let task = processor.spawn_critical(move || {
            waiter.wait_non_cancellable();
            current_task::is_cancel_requested()
        });
        std::thread::sleep(Duration::from_millis(20));
        task.request_cancel();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!task.is_finished());
        event.send();
        assert!(task.get().unwrap());
    }
}
