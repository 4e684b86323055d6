//! Error types surfaced by the engine API.

use crate::task::CancellationReason;

/// Failure of a task observed through its handle
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task was cancelled before producing a result
    #[error("task cancelled: {0}")]
    Cancelled(CancellationReason),

    /// The waiting task was itself cancelled while waiting for the result
    #[error("wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),

    /// The task body panicked; carries the panic message
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// A cancellable wait was interrupted by cancellation of the waiting task
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("wait interrupted: {0}")]
pub struct WaitInterruptedError(pub CancellationReason);

impl From<WaitInterruptedError> for TaskError {
    fn from(err: WaitInterruptedError) -> Self {
        TaskError::WaitInterrupted(err.0)
    }
}

/// Promise/future failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FutureError {
    /// The promise was dropped without setting a value
    #[error("promise dropped without a value")]
    PromiseBroken,

    /// The producer reported a failure instead of a value
    #[error("promise failed: {0}")]
    Failed(String),

    /// The waiting task was cancelled
    #[error("wait interrupted: {0}")]
    WaitInterrupted(CancellationReason),
}

impl From<WaitInterruptedError> for FutureError {
    fn from(err: WaitInterruptedError) -> Self {
        FutureError::WaitInterrupted(err.0)
    }
}

/// Failure to create an execution context for a task
#[derive(Debug, thiserror::Error)]
pub enum CoroutineError {
    /// The OS refused to create the backing stack/thread
    #[error("failed to allocate coroutine: {0}")]
    Allocation(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The TOML document could not be parsed
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// A value is outside of its valid range
    #[error("invalid config value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Human readable description
        reason: String,
    },
}

/// Errors from constructing engine components
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Coroutine pool could not be populated
    #[error(transparent)]
    Coroutine(#[from] CoroutineError),

    /// A worker or timer thread could not be started
    #[error("failed to spawn engine thread: {0}")]
    Thread(std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_error_display() {
        let err = TaskError::Cancelled(CancellationReason::UserRequest);
        assert_eq!(err.to_string(), "task cancelled: cancelled by user request");
        let err = TaskError::Panicked("x".to_string());
        assert_eq!(err.to_string(), "task panicked: x");
    }

    #[test]
    fn test_wait_interrupted_conversion() {
        let err: TaskError = WaitInterruptedError(CancellationReason::Deadline).into();
        assert_eq!(err, TaskError::WaitInterrupted(CancellationReason::Deadline));
        let err: FutureError = WaitInterruptedError(CancellationReason::Shutdown).into();
        assert_eq!(err, FutureError::WaitInterrupted(CancellationReason::Shutdown));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid {
            field: "max_size",
            reason: "must be positive".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid config value for max_size: must be positive"
        );
    }
}
