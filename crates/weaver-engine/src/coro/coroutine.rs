use std::cell::RefCell;
use std::fmt;
use std::panic;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::error::CoroutineError;
use crate::scheduler::worker::{self, WorkerContext};
use crate::task::{current_task, CoroUnwinder, TaskContext};
use crate::utils;

/// Who owns the baton
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Turn {
    /// The driving worker runs, the coroutine is parked
    Scheduler,
    /// The coroutine runs, the worker is parked in `resume`
    Coroutine,
    /// The coroutine must unwind and exit
    Exit,
}

struct Baton {
    turn: Turn,
    /// Task the coroutine is executing
    context: Option<Arc<TaskContext>>,
    /// Worker state travelling with the baton so that code running on the
    /// coroutine sees the worker it was resumed from
    worker: Option<Box<WorkerContext>>,
}

struct Shared {
    baton: Mutex<Baton>,
    to_coroutine: Condvar,
    to_scheduler: Condvar,
}

thread_local! {
    /// Set on coroutine threads only
    static CURRENT_COROUTINE: RefCell<Option<Arc<Shared>>> = const { RefCell::new(None) };
}

/// Execution context with its own stack
pub(crate) struct Coroutine {
    index: usize,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Coroutine {
    /// Allocate a coroutine with a stack of `stack_size` bytes
    pub(crate) fn spawn(index: usize, stack_size: usize, name: &str) -> Result<Self, CoroutineError> {
        let shared = Arc::new(Shared {
            baton: Mutex::new(Baton {
                turn: Turn::Scheduler,
                context: None,
                worker: None,
            }),
            to_coroutine: Condvar::new(),
            to_scheduler: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name(format!("{name}-coro-{index}"))
            .stack_size(stack_size)
            .spawn(move || trampoline(thread_shared))?;
        trace!(index, stack_size, "coroutine allocated");
        Ok(Self {
            index,
            shared,
            thread: Some(thread),
        })
    }

    #[cfg(test)]
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Run `context` on this coroutine until it suspends or finishes.
    ///
    /// Called on a worker thread. The worker state is lent to the coroutine
    /// for the duration of the step.
    pub(crate) fn resume(&self, context: &Arc<TaskContext>) {
        let worker = worker::uninstall();
        let mut baton = self.shared.baton.lock();
        if baton.context.is_none() {
            baton.context = Some(context.clone());
        }
        baton.worker = worker;
        baton.turn = Turn::Coroutine;
        self.shared.to_coroutine.notify_one();
        while baton.turn == Turn::Coroutine {
            self.shared.to_scheduler.wait(&mut baton);
        }
        let worker = baton.worker.take();
        drop(baton);
        worker::install(worker);
    }
}

impl Drop for Coroutine {
    fn drop(&mut self) {
        {
            let mut baton = self.shared.baton.lock();
            baton.turn = Turn::Exit;
            self.shared.to_coroutine.notify_one();
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl fmt::Debug for Coroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine").field("index", &self.index).finish()
    }
}

/// Hand control back to the worker that resumed the current coroutine and
/// park until resumed again.
///
/// Unwinds with [`CoroUnwinder`] if the coroutine is destroyed meanwhile.
pub(crate) fn suspend() {
    let Some(shared) = CURRENT_COROUTINE.with(|current| current.borrow().clone()) else {
        utils::abort_with_stacktrace("suspend called outside of a coroutine");
    };
    let mut baton = shared.baton.lock();
    baton.worker = worker::uninstall();
    baton.turn = Turn::Scheduler;
    shared.to_scheduler.notify_one();
    while baton.turn == Turn::Scheduler {
        shared.to_coroutine.wait(&mut baton);
    }
    if baton.turn == Turn::Exit {
        drop(baton);
        panic::resume_unwind(Box::new(CoroUnwinder));
    }
    let worker = baton.worker.take();
    drop(baton);
    worker::install(worker);
}

fn trampoline(shared: Arc<Shared>) {
    CURRENT_COROUTINE.with(|current| *current.borrow_mut() = Some(shared.clone()));
    loop {
        let context = {
            let mut baton = shared.baton.lock();
            while baton.turn == Turn::Scheduler {
                shared.to_coroutine.wait(&mut baton);
            }
            if baton.turn == Turn::Exit {
                break;
            }
            worker::install(baton.worker.take());
            baton.context.clone()
        };

        if let Some(context) = context {
            current_task::set_current(Some(context.clone()));
            context.coro_func();
            current_task::set_current(None);
        }

        let mut baton = shared.baton.lock();
        baton.context = None;
        baton.worker = worker::uninstall();
        if baton.turn == Turn::Exit {
            break;
        }
        baton.turn = Turn::Scheduler;
        shared.to_scheduler.notify_one();
    }
    CURRENT_COROUTINE.with(|current| current.borrow_mut().take());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_and_drop_idle() {
        let coroutine = Coroutine::spawn(7, 128 * 1024, "test").unwrap();
        assert_eq!(coroutine.index(), 7);
        drop(coroutine);
    }

    #[test]
    fn test_thread_name() {
        let coroutine = Coroutine::spawn(3, 128 * 1024, "named").unwrap();
        let name = coroutine
            .thread
            .as_ref()
            .and_then(|thread| thread.thread().name().map(str::to_string));
        assert_eq!(name.as_deref(), Some("named-coro-3"));
    }
}
