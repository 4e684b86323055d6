//! One-shot promise/future pair.
//!
//! The producer side ([`Promise`]) is satisfied once with a value or an
//! error; the consumer side ([`Future`]) waits for it from a task or from a
//! plain OS thread. Dropping an unsatisfied promise breaks the future.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::deadline::Deadline;
use crate::error::{FutureError, WaitInterruptedError};
use crate::task::{current_task, AccessorsWaitStrategy, ContextAccessor, EarlyWakeup, TaskContext, WakeupSource};
use crate::wait_list::WaitListLight;

/// Outcome of a bounded wait on a [`Future`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FutureStatus {
    /// The value (or error) is available
    Ready,
    /// The deadline expired first
    Timeout,
}

struct FutureState<T> {
    outcome: Mutex<Option<Result<T, FutureError>>>,
    is_ready: AtomicBool,
    /// Wakes a consumer blocked outside of a task
    ready_cv: Condvar,
    waiters: WaitListLight,
}

impl<T> FutureState<T> {
    fn new() -> Self {
        Self {
            outcome: Mutex::new(None),
            is_ready: AtomicBool::new(false),
            ready_cv: Condvar::new(),
            waiters: WaitListLight::new(),
        }
    }

    fn is_ready(&self) -> bool {
        self.is_ready.load(Ordering::Acquire)
    }

    fn set(&self, outcome: Result<T, FutureError>) {
        {
            let mut slot = self.outcome.lock();
            uassert!(slot.is_none(), "promise satisfied twice");
            *slot = Some(outcome);
            self.is_ready.store(true, Ordering::Release);
            self.ready_cv.notify_all();
        }
        self.waiters.wakeup_one();
    }

    fn wait_blocking(&self, deadline: Deadline) -> FutureStatus {
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            match deadline.instant() {
                Some(at) => {
                    if self.ready_cv.wait_until(&mut outcome, at).timed_out() {
                        break;
                    }
                }
                None => self.ready_cv.wait(&mut outcome),
            }
        }
        if outcome.is_some() {
            FutureStatus::Ready
        } else {
            FutureStatus::Timeout
        }
    }
}

impl<T: Send> FutureState<T> {
    fn wait_until(&self, deadline: Deadline) -> Result<FutureStatus, WaitInterruptedError> {
        if self.is_ready() {
            return Ok(FutureStatus::Ready);
        }
        match current_task::try_context() {
            Some(current) => self.wait_in_task(&current, deadline),
            None => Ok(self.wait_blocking(deadline)),
        }
    }

    fn wait_in_task(
        &self,
        current: &Arc<TaskContext>,
        deadline: Deadline,
    ) -> Result<FutureStatus, WaitInterruptedError> {
        loop {
            let targets: [&dyn ContextAccessor; 1] = [self];
            let mut strategy = AccessorsWaitStrategy::new(current, &targets);
            let source = current.sleep(&mut strategy, deadline);
            if self.is_ready() {
                return Ok(FutureStatus::Ready);
            }
            match source {
                WakeupSource::CancelRequest => {
                    return Err(WaitInterruptedError(current.cancellation_reason()))
                }
                WakeupSource::DeadlineTimer => return Ok(FutureStatus::Timeout),
                _ => {}
            }
        }
    }
}

impl<T: Send> ContextAccessor for FutureState<T> {
    fn is_ready(&self) -> bool {
        FutureState::is_ready(self)
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.waiters.append(waiter);
        EarlyWakeup(self.is_ready())
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.waiters.remove(waiter);
    }
}

/// Create a connected promise/future pair
pub fn channel<T>() -> (Promise<T>, Future<T>) {
    let state = Arc::new(FutureState::new());
    (
        Promise {
            state: Some(state.clone()),
        },
        Future { state },
    )
}

/// Producer side of a one-shot value
pub struct Promise<T> {
    /// Taken once the promise is satisfied
    state: Option<Arc<FutureState<T>>>,
}

impl<T> Promise<T> {
    /// Fulfil the future with `value`
    pub fn set_value(mut self, value: T) {
        if let Some(state) = self.state.take() {
            state.set(Ok(value));
        }
    }

    /// Fail the future with a message
    pub fn set_error(mut self, message: impl Into<String>) {
        if let Some(state) = self.state.take() {
            state.set(Err(FutureError::Failed(message.into())));
        }
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            trace!("promise dropped unsatisfied");
            state.set(Err(FutureError::PromiseBroken));
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("is_satisfied", &self.state.is_none())
            .finish()
    }
}

/// Consumer side of a one-shot value
pub struct Future<T> {
    state: Arc<FutureState<T>>,
}

impl<T> Future<T> {
    /// Whether the value or an error is available
    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

impl<T: Send> Future<T> {
    /// Wait for the outcome; a cancelled waiting task is interrupted
    pub fn wait(&self) -> Result<(), WaitInterruptedError> {
        self.wait_until(Deadline::unreachable()).map(|_| ())
    }

    /// Wait at most `timeout`
    pub fn wait_for(&self, timeout: Duration) -> Result<FutureStatus, WaitInterruptedError> {
        self.wait_until(Deadline::from_duration(timeout))
    }

    /// Wait until `deadline`
    pub fn wait_until(&self, deadline: Deadline) -> Result<FutureStatus, WaitInterruptedError> {
        self.state.wait_until(deadline)
    }

    /// Wait for and take the value
    pub fn get(self) -> Result<T, FutureError> {
        while !self.is_ready() {
            self.wait()?;
        }
        self.state
            .outcome
            .lock()
            .take()
            .unwrap_or(Err(FutureError::PromiseBroken))
    }
}

impl<T: Send> ContextAccessor for Future<T> {
    fn is_ready(&self) -> bool {
        self.state.is_ready()
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.state.try_append_waiter(waiter)
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.state.remove_waiter(waiter);
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Future")
            .field("is_ready", &self.is_ready())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use crate::task::{wait_any, CancellationReason};
    use std::thread;

    #[test]
    fn test_value_across_tasks() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let (promise, future) = channel();
        let consumer = processor.spawn(move || future.get());
        let producer = processor.spawn(move || {
            current_task::sleep_for(Duration::from_millis(5));
            promise.set_value(42);
        });
        producer.get().unwrap();
        assert_eq!(consumer.get().unwrap(), Ok(42));
    }

    #[test]
    fn test_get_from_plain_thread() {
        let (promise, future) = channel();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            promise.set_value("done");
        });
        assert_eq!(future.get(), Ok("done"));
        producer.join().unwrap();
    }

    #[test]
    fn test_set_error() {
        let (promise, future) = channel::<u32>();
        promise.set_error("backend unavailable");
        assert!(future.is_ready());
        assert_eq!(
            future.get(),
            Err(FutureError::Failed("backend unavailable".to_string()))
        );
    }

    #[test]
    fn test_dropped_promise_breaks_future() {
        let (promise, future) = channel::<u32>();
        drop(promise);
        assert_eq!(future.get(), Err(FutureError::PromiseBroken));
    }

    #[test]
    fn test_wait_for_timeout_outside_task() {
        let (_promise, future) = channel::<u32>();
        assert_eq!(
            future.wait_for(Duration::from_millis(5)),
            Ok(FutureStatus::Timeout)
        );
    }

    #[test]
    fn test_cancelled_waiter_is_interrupted() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let result = processor
            .spawn(|| {
                let (_promise, future) = channel::<u32>();
                current_task::context().request_cancel(CancellationReason::UserRequest);
                future.get()
            })
            .get()
            .unwrap();
        assert_eq!(
            result,
            Err(FutureError::WaitInterrupted(CancellationReason::UserRequest))
        );
    }

    #[test]
    fn test_participates_in_wait_any() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let index = processor
            .spawn(|| {
                let (_idle, never) = channel::<u32>();
                let (promise, future) = channel::<u32>();
                let _producer = current_task::spawn(move || promise.set_value(1));
                let targets: [&dyn ContextAccessor; 2] = [&never, &future];
                wait_any(&targets).unwrap()
            })
            .get()
            .unwrap();
        assert_eq!(index, Some(1));
    }
}
