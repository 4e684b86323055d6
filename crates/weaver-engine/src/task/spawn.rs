//! Spawning tasks on a processor.

use std::sync::Arc;

use super::cancel::Importance;
use super::context::TaskContext;
use super::handle::TaskWithResult;
use super::payload::{ResultSlot, WrappedCall, WrappedCallImpl};
use super::shared::SharedTaskWithResult;
use crate::deadline::Deadline;
use crate::scheduler::ProcessorHandle;
use crate::wait_list::WaitMode;

/// How a task is started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Critical tasks always start their body
    pub importance: Importance,
    /// Cancellation deadline
    pub deadline: Deadline,
    /// Whether several tasks may wait for this one at once
    pub wait_mode: WaitMode,
    /// Schedule through the low priority background queue
    pub background: bool,
    /// Enter a `task` tracing span while the body runs
    pub span: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            importance: Importance::Normal,
            deadline: Deadline::unreachable(),
            wait_mode: WaitMode::SingleWaiter,
            background: false,
            span: true,
        }
    }
}

impl SpawnOptions {
    /// Mark the task critical
    pub fn critical(mut self) -> Self {
        self.importance = Importance::Critical;
        self
    }

    /// Cancel the task once `deadline` expires
    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }

    /// Allow several waiters
    pub fn shared(mut self) -> Self {
        self.wait_mode = WaitMode::MultipleWaiters;
        self
    }

    /// Schedule through the background queue
    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    /// Do not create a tracing span
    pub fn no_span(mut self) -> Self {
        self.span = false;
        self
    }
}

impl ProcessorHandle {
    /// Spawn a task
    pub fn spawn<F, T>(&self, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default(), func)
    }

    /// Spawn a task whose body runs even if cancelled before it starts
    pub fn spawn_critical<F, T>(&self, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default().critical(), func)
    }

    /// Spawn a task through the background queue
    pub fn spawn_background<F, T>(&self, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default().background(), func)
    }

    /// Spawn a task cancelled once `deadline` expires
    pub fn spawn_with_deadline<F, T>(&self, deadline: Deadline, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default().with_deadline(deadline), func)
    }

    /// Spawn a task without a tracing span
    pub fn spawn_no_span<F, T>(&self, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.spawn_with(SpawnOptions::default().no_span(), func)
    }

    /// Spawn a task with explicit options
    pub fn spawn_with<F, T>(&self, options: SpawnOptions, func: F) -> TaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let slot = ResultSlot::new();
        let context = self.start_task(&options, WrappedCallImpl::new(func, slot.clone()));
        TaskWithResult::new(context, slot)
    }

    /// Spawn a task that several tasks may wait for
    pub fn spawn_shared<F, T>(&self, func: F) -> SharedTaskWithResult<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let options = SpawnOptions::default().shared();
        let slot = ResultSlot::new();
        let context = self.start_task(&options, WrappedCallImpl::new(func, slot.clone()));
        SharedTaskWithResult::new(context, slot)
    }

    fn start_task(
        &self,
        options: &SpawnOptions,
        payload: Box<dyn WrappedCall>,
    ) -> Arc<TaskContext> {
        let context = TaskContext::new(self.shared().clone(), options, payload);
        context.start();
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::error::TaskError;
    use crate::scheduler::TaskProcessor;
    use crate::task::{current_task, CancellationReason};
    use std::time::Duration;

    #[test]
    fn test_options_builders() {
        let options = SpawnOptions::default().critical().shared().background().no_span();
        assert_eq!(options.importance, Importance::Critical);
        assert_eq!(options.wait_mode, WaitMode::MultipleWaiters);
        assert!(options.background);
        assert!(!options.span);
    }

    #[test]
    fn test_spawn_variants() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        assert_eq!(processor.spawn_background(|| 1).get(), Ok(1));
        assert_eq!(processor.spawn_no_span(|| 2).get(), Ok(2));
        assert_eq!(processor.spawn_critical(|| 3).get(), Ok(3));
    }

    #[test]
    fn test_spawn_with_deadline() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let task = processor.spawn_with_deadline(Deadline::from_duration(Duration::from_millis(10)), || {
            current_task::interruptible_sleep_for(Duration::from_secs(20));
            current_task::cancellation_point();
        });
        assert_eq!(
            task.get(),
            Err(TaskError::Cancelled(CancellationReason::Deadline))
        );
    }
}
