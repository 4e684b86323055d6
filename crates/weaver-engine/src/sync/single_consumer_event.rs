//! Event with a single waiting task, reset automatically on wakeup by default.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::deadline::Deadline;
use crate::task::{current_task, EarlyWakeup, TaskContext, WaitStrategy};
use crate::wait_list::WaitListLight;

/// Event for one waiting task and any number of senders.
///
/// Waits are cancellable and report cancellation by returning `false`.
pub struct SingleConsumerEvent {
    is_signaled: AtomicBool,
    auto_reset: bool,
    waiters: WaitListLight,
}

impl SingleConsumerEvent {
    /// Event that resets itself when a waiter consumes the signal
    pub fn new() -> Self {
        Self::with_auto_reset(true)
    }

    /// Event that stays signaled until [`reset`](Self::reset) is called
    pub fn without_auto_reset() -> Self {
        Self::with_auto_reset(false)
    }

    fn with_auto_reset(auto_reset: bool) -> Self {
        Self {
            is_signaled: AtomicBool::new(false),
            auto_reset,
            waiters: WaitListLight::new(),
        }
    }

    /// Wait for the event. `false` if the waiting task was cancelled.
    pub fn wait_for_event(&self) -> bool {
        self.wait_for_event_until(Deadline::unreachable())
    }

    /// Wait for the event until `deadline`
    pub fn wait_for_event_until(&self, deadline: Deadline) -> bool {
        if self.take_signal() {
            return true;
        }
        let current = current_task::context();
        loop {
            let mut strategy = EventWaitStrategy {
                event: self,
                current: &current,
            };
            let source = current.sleep(&mut strategy, deadline);
            if self.take_signal() {
                return true;
            }
            if !source.has_wait_succeeded() {
                return false;
            }
        }
    }

    /// Signal the event, waking the waiter if any
    pub fn send(&self) {
        self.is_signaled.store(true, Ordering::SeqCst);
        self.waiters.wakeup_one();
    }

    /// Clear the signal
    pub fn reset(&self) {
        self.is_signaled.store(false, Ordering::SeqCst);
    }

    /// Whether the event is signaled
    pub fn is_ready(&self) -> bool {
        self.is_signaled.load(Ordering::SeqCst)
    }

    fn take_signal(&self) -> bool {
        if self.auto_reset {
            self.is_signaled.swap(false, Ordering::SeqCst)
        } else {
            self.is_signaled.load(Ordering::SeqCst)
        }
    }
}

struct EventWaitStrategy<'a> {
    event: &'a SingleConsumerEvent,
    current: &'a Arc<TaskContext>,
}

impl WaitStrategy for EventWaitStrategy<'_> {
    fn setup_wakeups(&mut self) -> EarlyWakeup {
        self.event.waiters.append(self.current);
        EarlyWakeup(self.event.is_ready())
    }

    fn disable_wakeups(&mut self) {
        self.event.waiters.remove(self.current);
    }
}

impl Default for SingleConsumerEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SingleConsumerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleConsumerEvent")
            .field("is_signaled", &self.is_ready())
            .field("auto_reset", &self.auto_reset)
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
    fn test_send_before_wait() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let event = Arc::new(SingleConsumerEvent::new());
        event.send();
        let consumer = event.clone();
        let (first, second) = processor
            .spawn(move || {
                let first = consumer.wait_for_event();
                let second = consumer
                    .wait_for_event_until(Deadline::from_duration(Duration::from_millis(5)));
                (first, second)
            })
            .get()
            .unwrap();
        assert!(first);
        assert!(!second);
    }

    #[test]
    fn test_wakeup_from_other_thread() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let event = Arc::new(SingleConsumerEvent::new());
        let consumer = event.clone();
        let waiter = processor.spawn(move || consumer.wait_for_event());
        std::thread::sleep(Duration::from_millis(20));
        event.send();
        assert!(waiter.get().unwrap());
        assert!(!event.is_ready());
    }

    #[test]
    fn test_without_auto_reset() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let event = Arc::new(SingleConsumerEvent::without_auto_reset());
        event.send();
        let consumer = event.clone();
        let both = processor
            .spawn(move || consumer.wait_for_event() && consumer.wait_for_event())
            .get()
            .unwrap();
        assert!(both);
        assert!(event.is_ready());
        event.reset();
        assert!(!event.is_ready());
    }

    #[test]
    fn test_cancel_returns_false() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let event = Arc::new(SingleConsumerEvent::new());
        let consumer = event.clone();
        let waiter = processor.spawn_critical(move || consumer.wait_for_event());
        std::thread::sleep(Duration::from_millis(20));
        waiter.request_cancel();
        assert!(!waiter.get().unwrap());
    }
}
