//! Task handles
//!
//! [`Task`] observes and controls a task; [`TaskWithResult`] additionally
//! carries the produced value. Dropping a handle of an unfinished task
//! cancels the task and waits for it.

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use tracing::trace;

use super::cancel::{CancellationReason, TaskState};
use super::context::{TaskContext, TaskId};
use super::payload::ResultSlot;
use super::wait::{ContextAccessor, EarlyWakeup};
use crate::deadline::Deadline;
use crate::error::{TaskError, WaitInterruptedError};

/// Handle of a task without access to its result
#[derive(Default)]
pub struct Task {
    context: Option<Arc<TaskContext>>,
}

impl Task {
    pub(crate) fn new(context: Arc<TaskContext>) -> Self {
        Self {
            context: Some(context),
        }
    }

    /// Empty handle that does not refer to any task
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Whether the handle refers to a task
    pub fn is_valid(&self) -> bool {
        self.context.is_some()
    }

    #[track_caller]
    pub(crate) fn context(&self) -> &Arc<TaskContext> {
        match &self.context {
            Some(context) => context,
            None => crate::utils::invariant_failed(format_args!("task handle is invalid")),
        }
    }

    /// Task id
    #[track_caller]
    pub fn id(&self) -> TaskId {
        self.context().id()
    }

    /// Current state, `Invalid` for an empty handle
    pub fn state(&self) -> TaskState {
        self.context
            .as_ref()
            .map_or(TaskState::Invalid, |context| context.state())
    }

    /// Whether the task finished
    #[track_caller]
    pub fn is_finished(&self) -> bool {
        self.context().is_finished()
    }

    /// Requested cancellation reason
    #[track_caller]
    pub fn cancellation_reason(&self) -> CancellationReason {
        self.context().cancellation_reason()
    }

    /// Wait for the task to finish.
    ///
    /// Inside a task the wait is interrupted by cancellation of the waiter.
    #[track_caller]
    pub fn wait(&self) -> Result<(), WaitInterruptedError> {
        self.wait_until(Deadline::unreachable())
    }

    /// Wait at most `timeout`. The task may still be running afterwards.
    #[track_caller]
    pub fn wait_for(&self, timeout: Duration) -> Result<(), WaitInterruptedError> {
        self.wait_until(Deadline::from_duration(timeout))
    }

    /// Wait until `deadline`. The task may still be running afterwards.
    #[track_caller]
    pub fn wait_until(&self, deadline: Deadline) -> Result<(), WaitInterruptedError> {
        self.context().wait_until(deadline)
    }

    /// Ask the task to stop
    #[track_caller]
    pub fn request_cancel(&self) {
        self.context().request_cancel(CancellationReason::UserRequest);
    }

    /// Request cancellation and wait until the task finishes, ignoring
    /// cancellation of the caller
    #[track_caller]
    pub fn sync_cancel(&self) {
        let context = self.context();
        context.request_cancel(CancellationReason::UserRequest);
        context.wait_non_cancellable();
    }

    /// Let the task run to completion without a handle.
    ///
    /// The processor keeps track of it and cancels it on shutdown.
    #[track_caller]
    pub fn detach(mut self) {
        let Some(context) = self.context.take() else {
            crate::utils::invariant_failed(format_args!("detaching an invalid task handle"));
        };
        trace!(task_id = %context.id(), "task detached");
        context.set_detached();
    }

    fn terminate(&mut self, reason: CancellationReason) {
        if let Some(context) = self.context.take() {
            if !context.is_finished() {
                context.request_cancel(reason);
                context.wait_non_cancellable();
            }
        }
    }
}

impl ContextAccessor for Task {
    fn is_ready(&self) -> bool {
        self.context.as_ref().map_or(true, |context| context.is_finished())
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        match &self.context {
            Some(context) => context.try_append_waiter(waiter),
            None => EarlyWakeup(true),
        }
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        if let Some(context) = &self.context {
            context.remove_waiter(waiter);
        }
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.terminate(CancellationReason::Abandoned);
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => f
                .debug_struct("Task")
                .field("id", &context.id())
                .field("state", &context.state())
                .finish(),
            None => f.write_str("Task(invalid)"),
        }
    }
}

/// Handle of a task producing a `T`
pub struct TaskWithResult<T> {
    task: Task,
    slot: Arc<ResultSlot<T>>,
}

impl<T> TaskWithResult<T> {
    pub(crate) fn new(context: Arc<TaskContext>, slot: Arc<ResultSlot<T>>) -> Self {
        Self {
            task: Task::new(context),
            slot,
        }
    }

    /// Wait for the task and take its value.
    ///
    /// Consumes the handle, so the value can be retrieved only once.
    #[track_caller]
    pub fn get(self) -> Result<T, TaskError> {
        let context = self.task.context();
        while !context.is_finished() {
            context.wait_until(Deadline::unreachable())?;
        }
        result_of(context, self.slot.take())
    }

    /// Drop the result and keep a plain [`Task`] handle
    pub fn into_task(self) -> Task {
        let Self { task, .. } = self;
        task
    }

    /// Let the task run to completion without a handle; see [`Task::detach`]
    pub fn detach(self) {
        self.into_task().detach();
    }
}

/// Translate the final state and stored outcome of a finished task
pub(crate) fn result_of<T>(
    context: &TaskContext,
    outcome: Option<Result<T, String>>,
) -> Result<T, TaskError> {
    match outcome {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(TaskError::Panicked(message)),
        None => {
            uassert!(
                context.state() == TaskState::Cancelled,
                "task {} completed without a result",
                context.id()
            );
            Err(TaskError::Cancelled(context.cancellation_reason()))
        }
    }
}

impl<T> Deref for TaskWithResult<T> {
    type Target = Task;

    fn deref(&self) -> &Task {
        &self.task
    }
}

impl<T> ContextAccessor for TaskWithResult<T>
where
    T: Send,
{
    fn is_ready(&self) -> bool {
        self.task.is_ready()
    }

    fn try_append_waiter(&self, waiter: &Arc<TaskContext>) -> EarlyWakeup {
        self.task.try_append_waiter(waiter)
    }

    fn remove_waiter(&self, waiter: &TaskContext) {
        self.task.remove_waiter(waiter);
    }
}

impl<T> fmt::Debug for TaskWithResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskWithResult").field(&self.task).finish()
    }
}
