//! Wait lists
//!
//! Every blocking primitive parks its waiters in one of these lists and
//! wakes them with the epoch recorded at append time, so a wakeup can never
//! resume a later, unrelated sleep of the same task.

mod generic;
mod light;
mod list;

pub use generic::{GenericWaitList, WaitMode};
pub use light::WaitListLight;
pub use list::{WaitList, WaitListLock};
