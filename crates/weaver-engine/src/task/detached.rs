//! Registry of detached tasks of one processor.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::cancel::CancellationReason;
use super::context::{TaskContext, TaskId};

/// Keeps detached tasks alive and reachable for mass cancellation
#[derive(Debug, Default)]
pub(crate) struct DetachedTasksSyncBlock {
    tasks: DashMap<TaskId, Arc<TaskContext>>,
}

impl DetachedTasksSyncBlock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, context: Arc<TaskContext>) {
        self.tasks.insert(context.id(), context);
    }

    pub(crate) fn remove(&self, id: TaskId) {
        self.tasks.remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Request cancellation of every registered task
    pub(crate) fn request_cancellation(&self, reason: CancellationReason) {
        // collect first: cancelling may finish a task, which removes it
        let contexts: Vec<_> = self
            .tasks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        debug!(count = contexts.len(), %reason, "cancelling detached tasks");
        for context in contexts {
            context.request_cancel(reason);
        }
    }

    /// Block until every registered task finished
    pub(crate) fn wait_all(&self) {
        loop {
            let next = self.tasks.iter().next().map(|entry| entry.value().clone());
            match next {
                Some(context) => {
                    context.wait_non_cancellable();
                    self.tasks.remove(&context.id());
                }
                None => break,
            }
        }
    }
}
