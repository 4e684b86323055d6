//! Absolute points in time used by every blocking wait.

use std::cmp::Ordering;
use std::time::{Duration, Instant};

/// Absolute deadline on the steady clock, or "never".
///
/// An unreachable deadline compares greater than every reachable one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct Deadline {
    /// `None` means the deadline is never reached
    at: Option<Instant>,
}

impl Deadline {
    /// A deadline that is never reached
    pub const fn unreachable() -> Self {
        Self { at: None }
    }

    /// A deadline that has already been reached
    pub fn passed() -> Self {
        Self {
            at: Some(Instant::now()),
        }
    }

    /// Deadline `duration` from now. Saturates to unreachable on overflow.
    pub fn from_duration(duration: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(duration),
        }
    }

    /// Deadline at a specific instant
    pub fn from_instant(at: Instant) -> Self {
        Self { at: Some(at) }
    }

    /// Whether the deadline can ever be reached
    pub fn is_reachable(&self) -> bool {
        self.at.is_some()
    }

    /// Whether the deadline has been reached
    pub fn is_reached(&self) -> bool {
        match self.at {
            Some(at) => at <= Instant::now(),
            None => false,
        }
    }

    /// Time left until the deadline; `None` for an unreachable deadline
    pub fn time_left(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// The underlying instant, if reachable
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }
}

impl From<Duration> for Deadline {
    fn from(duration: Duration) -> Self {
        Self::from_duration(duration)
    }
}

impl From<Instant> for Deadline {
    fn from(at: Instant) -> Self {
        Self::from_instant(at)
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.at, other.at) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
