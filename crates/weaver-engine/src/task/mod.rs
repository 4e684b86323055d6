//! Tasks
//!
//! A task is a unit of cooperative work executed on a coroutine of a task
//! processor. This module holds the per-task state machine
//! ([`TaskContext`]), the user-facing handles, composite waits and the API
//! available to code running inside a task ([`current_task`]).

mod cancel;
mod context;
pub mod current_task;
mod detached;
mod handle;
mod payload;
mod shared;
mod sleep_state;
mod spawn;
mod wait;
mod wait_any;

pub use cancel::{CancellationReason, Importance, TaskState, WakeupSource};
pub use context::{TaskContext, TaskId};
pub use handle::{Task, TaskWithResult};
pub use shared::SharedTaskWithResult;
pub use sleep_state::Epoch;
pub use spawn::SpawnOptions;
pub use wait::{ContextAccessor, EarlyWakeup, WaitStrategy};
pub use wait_any::{get_all, wait_all, wait_any, wait_any_until};

pub(crate) use cancel::CoroUnwinder;
pub(crate) use detached::DetachedTasksSyncBlock;
pub(crate) use wait::AccessorsWaitStrategy;
