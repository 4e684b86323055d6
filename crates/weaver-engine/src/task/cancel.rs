//! Task states, cancellation reasons and wakeup sources.

use std::fmt;

/// Why a task was asked to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CancellationReason {
    /// Not cancelled
    #[default]
    None = 0,
    /// Explicit request through a handle
    UserRequest = 1,
    /// The task deadline expired
    Deadline = 2,
    /// The processor is shutting down
    Shutdown = 3,
    /// The processor is overloaded
    Overload = 4,
    /// The handle was dropped while the task was running
    Abandoned = 5,
}

impl CancellationReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::UserRequest,
            2 => Self::Deadline,
            3 => Self::Shutdown,
            4 => Self::Overload,
            5 => Self::Abandoned,
            _ => Self::None,
        }
    }
}

impl fmt::Display for CancellationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "not cancelled",
            Self::UserRequest => "cancelled by user request",
            Self::Deadline => "deadline expired",
            Self::Shutdown => "task processor shutdown",
            Self::Overload => "task processor overload",
            Self::Abandoned => "task handle abandoned",
        };
        f.write_str(text)
    }
}

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    /// Handle does not refer to a task
    Invalid = 0,
    /// Created, not yet scheduled
    New = 1,
    /// Waiting in a processor queue
    Queued = 2,
    /// Executing on a worker
    Running = 3,
    /// Parked on a primitive or a deadline
    Suspended = 4,
    /// Finished because of cancellation
    Cancelled = 5,
    /// Finished normally or with a panic
    Completed = 6,
}

impl TaskState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::New,
            2 => Self::Queued,
            3 => Self::Running,
            4 => Self::Suspended,
            5 => Self::Cancelled,
            6 => Self::Completed,
            _ => Self::Invalid,
        }
    }

    /// Whether the state is terminal
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Invalid => "invalid",
            Self::New => "new",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        f.write_str(text)
    }
}

/// Task importance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Importance {
    /// Regular task, may be dropped under overload or shutdown
    #[default]
    Normal,
    /// Task body always starts even if cancellation was requested before
    /// the first step
    Critical,
}

/// What resumed a sleeping task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WakeupSource {
    /// Not woken yet
    None = 0,
    /// Woken through a wait list by another task or thread
    WaitList = 1,
    /// The sleep deadline expired
    DeadlineTimer = 2,
    /// Cancellation was requested
    CancelRequest = 3,
    /// First scheduling of a new task
    Bootstrap = 4,
}

impl WakeupSource {
    /// Whether the awaited condition may have been satisfied
    pub fn has_wait_succeeded(self) -> bool {
        matches!(self, Self::WaitList | Self::Bootstrap)
    }
}

/// Why a coroutine handed control back to its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum YieldReason {
    None = 0,
    TaskWaiting = 1,
    TaskCancelled = 2,
    TaskComplete = 3,
}

impl YieldReason {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::TaskWaiting,
            2 => Self::TaskCancelled,
            3 => Self::TaskComplete,
            _ => Self::None,
        }
    }
}

/// Panic payload used to unwind a task stack on cancellation.
///
/// Recognized by the coroutine entry point and never reported as a task
/// failure.
#[derive(Debug)]
pub(crate) struct CoroUnwinder;
