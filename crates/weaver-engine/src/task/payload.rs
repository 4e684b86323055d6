//! Type-erased task body and its result slot.

use std::sync::Arc;

use parking_lot::Mutex;

/// Outcome stored for a finished task body: the value or a panic message.
pub(crate) type TaskOutcome<T> = Result<T, String>;

/// Shared storage for a task result, owned jointly by the body wrapper and
/// the result handle(s).
pub(crate) struct ResultSlot<T> {
    outcome: Mutex<Option<TaskOutcome<T>>>,
}

impl<T> ResultSlot<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
        })
    }

    pub(crate) fn set(&self, outcome: TaskOutcome<T>) {
        *self.outcome.lock() = Some(outcome);
    }

    /// Move the result out; `None` if already taken or never produced
    pub(crate) fn take(&self) -> Option<TaskOutcome<T>> {
        self.outcome.lock().take()
    }
}

impl<T: Clone> ResultSlot<T> {
    pub(crate) fn cloned(&self) -> Option<TaskOutcome<T>> {
        self.outcome.lock().clone()
    }
}

/// Type-erased task body
pub(crate) trait WrappedCall: Send {
    /// Runs the body and stores its value. Panics propagate to the caller.
    fn perform(&mut self);

    /// Records a panic raised by [`perform`](Self::perform)
    fn store_panic(&mut self, message: String);
}

pub(crate) struct WrappedCallImpl<F, T> {
    func: Option<F>,
    slot: Arc<ResultSlot<T>>,
}

impl<F, T> WrappedCallImpl<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    pub(crate) fn new(func: F, slot: Arc<ResultSlot<T>>) -> Box<dyn WrappedCall> {
        Box::new(Self {
            func: Some(func),
            slot,
        })
    }
}

impl<F, T> WrappedCall for WrappedCallImpl<F, T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    fn perform(&mut self) {
        if let Some(func) = self.func.take() {
            let value = func();
            self.slot.set(Ok(value));
        }
    }

    fn store_panic(&mut self, message: String) {
        self.slot.set(Err(message));
    }
}
