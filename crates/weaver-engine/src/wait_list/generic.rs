//! Wait list whose representation is chosen by the waiter count.

use std::sync::Arc;

use super::{WaitList, WaitListLight};
use crate::task::TaskContext;

/// How many tasks may wait on a primitive at the same time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WaitMode {
    /// At most one waiter
    #[default]
    SingleWaiter,
    /// Any number of waiters
    MultipleWaiters,
}

/// Either a [`WaitListLight`] or a [`WaitList`]
#[derive(Debug)]
pub enum GenericWaitList {
    /// Single waiter representation
    Light(WaitListLight),
    /// Multiple waiter representation
    List(WaitList),
}

impl GenericWaitList {
    /// Create a list for `mode`
    pub fn new(mode: WaitMode) -> Self {
        match mode {
            WaitMode::SingleWaiter => Self::Light(WaitListLight::new()),
            WaitMode::MultipleWaiters => Self::List(WaitList::new()),
        }
    }

    /// Register a waiter
    pub fn append(&self, context: &Arc<TaskContext>) {
        match self {
            Self::Light(list) => list.append(context),
            Self::List(list) => list.append(context),
        }
    }

    /// Unregister a waiter
    pub fn remove(&self, context: &TaskContext) {
        match self {
            Self::Light(list) => list.remove(context),
            Self::List(list) => list.remove(context),
        }
    }

    /// Wake every waiter
    pub fn wakeup_all(&self) {
        match self {
            Self::Light(list) => list.wakeup_all(),
            Self::List(list) => list.wakeup_all(),
        }
    }

    /// Whether several waiters are supported
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::List(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_selects_representation() {
        assert!(!GenericWaitList::new(WaitMode::SingleWaiter).is_shared());
        assert!(GenericWaitList::new(WaitMode::MultipleWaiters).is_shared());
        assert_eq!(WaitMode::default(), WaitMode::SingleWaiter);
    }
}
