//! Packed sleep state: wakeup flags plus the sleep epoch in one atomic word.
//!
//! The epoch is bumped every time a task goes to sleep. A wakeup carries the
//! epoch it was issued for, so wakeups aimed at an earlier sleep are ignored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Flags stored in the low byte of the sleep state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub(crate) struct SleepFlags: u8 {
        /// The coroutine has handed control back and waits for a wakeup
        const SLEEPING = 1 << 0;
        /// Cancellation requests must not wake this sleep
        const NON_CANCELLABLE = 1 << 1;
        const WAKEUP_BY_WAIT_LIST = 1 << 2;
        const WAKEUP_BY_DEADLINE_TIMER = 1 << 3;
        const WAKEUP_BY_CANCEL_REQUEST = 1 << 4;
        const WAKEUP_BY_BOOTSTRAP = 1 << 5;
    }
}

impl SleepFlags {
    /// Flags that record an arrived wakeup
    pub(crate) const WAKEUP_MASK: SleepFlags = SleepFlags::WAKEUP_BY_WAIT_LIST
        .union(SleepFlags::WAKEUP_BY_DEADLINE_TIMER)
        .union(SleepFlags::WAKEUP_BY_CANCEL_REQUEST)
        .union(SleepFlags::WAKEUP_BY_BOOTSTRAP);
}

/// Sleep cycle counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Epoch(pub(crate) u64);

impl Epoch {
    /// Largest representable epoch; wraps to zero after it
    const MAX: u64 = (1 << 56) - 1;

    /// The epoch following this one
    pub(crate) fn next(self) -> Self {
        Epoch((self.0 + 1) & Self::MAX)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unpacked sleep state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SleepState {
    pub(crate) flags: SleepFlags,
    pub(crate) epoch: Epoch,
}

impl SleepState {
    pub(crate) fn new(flags: SleepFlags, epoch: Epoch) -> Self {
        Self { flags, epoch }
    }

    fn pack(self) -> u64 {
        (self.epoch.0 << 8) | u64::from(self.flags.bits())
    }

    fn unpack(raw: u64) -> Self {
        Self {
            flags: SleepFlags::from_bits_truncate(raw as u8),
            epoch: Epoch(raw >> 8),
        }
    }
}

/// Atomic cell holding a [`SleepState`]
pub(crate) struct AtomicSleepState {
    raw: AtomicU64,
}

impl AtomicSleepState {
    pub(crate) fn new(state: SleepState) -> Self {
        Self {
            raw: AtomicU64::new(state.pack()),
        }
    }

    pub(crate) fn load(&self) -> SleepState {
        SleepState::unpack(self.raw.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, state: SleepState) {
        self.raw.store(state.pack(), Ordering::Release);
    }

    /// Sets `flags` and returns the previous state
    pub(crate) fn fetch_or_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(
            self.raw
                .fetch_or(u64::from(flags.bits()), Ordering::AcqRel),
        )
    }

    /// Clears `flags` and returns the previous state
    pub(crate) fn clear_flags(&self, flags: SleepFlags) -> SleepState {
        SleepState::unpack(
            self.raw
                .fetch_and(!u64::from(flags.bits()), Ordering::AcqRel),
        )
    }

    pub(crate) fn compare_exchange_weak(
        &self,
        current: SleepState,
        new: SleepState,
    ) -> Result<SleepState, SleepState> {
        self.raw
            .compare_exchange_weak(current.pack(), new.pack(), Ordering::AcqRel, Ordering::Acquire)
            .map(SleepState::unpack)
            .map_err(SleepState::unpack)
    }
}

impl fmt::Debug for AtomicSleepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack() {
        let state = SleepState::new(
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_CANCEL_REQUEST,
            Epoch(12345),
        );
        assert_eq!(SleepState::unpack(state.pack()), state);
    }

    #[test]
    fn test_fetch_or_keeps_epoch() {
        let cell = AtomicSleepState::new(SleepState::new(SleepFlags::empty(), Epoch(7)));
        let prev = cell.fetch_or_flags(SleepFlags::SLEEPING);
        assert_eq!(prev.flags, SleepFlags::empty());
        let now = cell.load();
        assert_eq!(now.epoch, Epoch(7));
        assert!(now.flags.contains(SleepFlags::SLEEPING));
    }

    #[test]
    fn test_clear_flags() {
        let cell = AtomicSleepState::new(SleepState::new(
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP,
            Epoch(1),
        ));
        cell.clear_flags(SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_BOOTSTRAP);
        assert_eq!(cell.load().flags, SleepFlags::empty());
    }

    #[test]
    fn test_epoch_wraps() {
        assert_eq!(Epoch(Epoch::MAX).next(), Epoch(0));
        assert_eq!(Epoch(1).next(), Epoch(2));
    }

    #[test]
    fn test_compare_exchange() {
        let initial = SleepState::new(SleepFlags::SLEEPING, Epoch(3));
        let cell = AtomicSleepState::new(initial);
        let stale = SleepState::new(SleepFlags::SLEEPING, Epoch(2));
        assert!(cell.compare_exchange_weak(stale, initial).is_err());
        let updated = SleepState::new(
            SleepFlags::SLEEPING | SleepFlags::WAKEUP_BY_WAIT_LIST,
            Epoch(3),
        );
        loop {
            if cell.compare_exchange_weak(initial, updated).is_ok() {
                break;
            }
        }
        assert_eq!(cell.load(), updated);
    }
}
