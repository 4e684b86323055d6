//! Weaver Engine
//!
//! Cooperative task engine that multiplexes many lightweight stackful tasks
//! over a fixed pool of OS worker threads:
//! - Coroutine pool (reusable execution contexts with their own stacks)
//! - Work-stealing task processor (per-worker local queues, sharded global
//!   queue, background queue, sleep/wake coordination)
//! - Task state machine with epoch-disambiguated wakeups and cooperative
//!   cancellation
//! - Wait lists used by every primitive to park and wake tasks
//! - Lock-free intrusive MPSC queue and task-aware producer/consumer queues
//! - Synchronization primitives (Mutex, events, semaphores, condition
//!   variable, promise/future, token bucket)
//!
//! Tasks are strictly cooperative: a task keeps its worker until it finishes
//! or suspends on a primitive, a deadline or an explicit yield.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[macro_use]
mod utils;

pub mod config;
pub mod coro;
pub mod deadline;
pub mod error;
pub mod future;
pub mod queue;
pub mod scheduler;
pub mod sync;
pub mod task;
pub mod wait_list;

pub use config::{
    CoroutinePoolConfig, EngineConfig, OverloadAction, TaskProcessorConfig, TaskProcessorSettings,
    TaskQueueType,
};
pub use coro::{CoroutinePool, CoroutinePoolStats};
pub use deadline::Deadline;
pub use error::{ConfigError, CoroutineError, EngineError, FutureError, TaskError, WaitInterruptedError};
pub use future::{Future, FutureStatus, Promise};
pub use queue::{MpscQueue, NonFifoMpmcQueue, SpmcQueue, SpscQueue, StringStreamQueue};
pub use scheduler::{ProcessorHandle, TaskProcessor, TaskProcessorStats};
pub use sync::{
    CancellableSemaphore, ConditionVariable, CvStatus, Mutex, MutexGuard, Semaphore,
    SingleConsumerEvent, SingleUseEvent, TokenBucket,
};
pub use task::{
    current_task, get_all, wait_all, wait_any, wait_any_until, CancellationReason, ContextAccessor,
    Importance, SharedTaskWithResult, SpawnOptions, Task, TaskId, TaskState, TaskWithResult,
};
