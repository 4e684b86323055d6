//! Coroutines
//!
//! A coroutine is a reusable execution context with its own stack. Each one
//! is backed by a dedicated OS thread created with the configured stack size;
//! a baton handed over through a mutex/condvar pair guarantees that either the
//! worker driving the coroutine or the coroutine itself runs, never both.

mod coroutine;
mod pool;

pub(crate) use coroutine::{suspend, Coroutine};
pub(crate) use pool::LocalCoroutineCache;
pub use pool::{CoroutinePool, CoroutinePoolStats};
