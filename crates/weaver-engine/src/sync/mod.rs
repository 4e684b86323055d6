//! Task-aware synchronization primitives
//!
//! Waiting on any of these suspends the calling task and frees its worker
//! thread. Non-blocking operations may be used from plain threads as well.

mod condvar;
mod mutex;
mod semaphore;
mod single_consumer_event;
mod single_use_event;
mod token_bucket;

pub use condvar::{ConditionVariable, CvStatus};
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::{CancellableSemaphore, Semaphore, SemaphoreError, SemaphoreGuard};
pub use single_consumer_event::SingleConsumerEvent;
pub use single_use_event::SingleUseEvent;
pub use token_bucket::{RefillPolicy, TokenBucket};
