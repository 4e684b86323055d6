//! Task handle that can be cloned and awaited by several tasks at once.

use std::fmt;
use std::sync::Arc;

use super::cancel::{CancellationReason, TaskState};
use super::context::{TaskContext, TaskId};
use super::handle::result_of;
use super::payload::ResultSlot;
use super::wait::{ContextAccessor, EarlyWakeup};
use crate::deadline::Deadline;
use crate::error::{TaskError, WaitInterruptedError};

struct SharedState<T> {
    context: Arc<TaskContext>,
    slot: Arc<ResultSlot<T>>,
}

impl<T> Drop for SharedState<T> {
    fn drop(&mut self) {
        if !self.context.is_finished() {
            self.context.request_cancel(CancellationReason::Abandoned);
            self.context.wait_non_cancellable();
        }
    }
}

/// Cloneable handle of a task producing a `T`.
///
/// The task is cancelled and awaited when the last clone is dropped.
pub struct SharedTaskWithResult<T> {
    state: Arc<SharedState<T>>,
}

impl<T> SharedTaskWithResult<T> {
    pub(crate) fn new(context: Arc<TaskContext>, slot: Arc<ResultSlot<T>>) -> Self {
        Self {
            state: Arc::new(SharedState { context, slot }),
        }
    }

    /// Task id
    pub fn id(&self) -> TaskId {
        self.state.context.id()
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        self.state.context.state()
    }

    /// Whether the task finished
    pub fn is_finished(&self) -> bool {
        self.state.context.is_finished()
    }

    /// Wait for the task to finish
    pub fn wait(&self) -> Result<(), WaitInterruptedError> {
        self.wait_until(Deadline::unreachable())
    }

    /// Wait until `deadline`
    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitInterruptedError> {
        self.state.context.wait_until(deadline)
    }

    /// Ask the task to stop
    pub fn request_cancel(&self) {
        self.state
            .context
            .request_cancel(CancellationReason::UserRequest);
    }
}

impl<T: Clone> SharedTaskWithResult<T> {
    /// Wait for the task and clone its value
    pub fn get(&self) -> Result<T, TaskError> {
        let context = &self.state.context;
        while !context.is_finished() {
            context.wait_until(Deadline::unreachable())?;
        }
        result_of(context, self.state.slot.cloned())
    }
}

impl<T> Clone for SharedTaskWithResult<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T: Send> ContextAccessor for SharedTaskWithResult<T> {
    fn is_ready(&self) -> bool {
        self.is_finished()
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.state.context.try_append_waiter(waiter)
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.state.context.remove_waiter(waiter);
    }
}

impl<T> fmt::Debug for SharedTaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedTaskWithResult")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}
