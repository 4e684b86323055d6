//! Queues
//!
//! [`intrusive`] is the allocation-free MPSC queue the engine uses
//! internally (timer registrations). [`generic`] holds the task-aware
//! producer/consumer queues offered to users.

pub mod generic;
pub mod intrusive;

pub use generic::{
    Consumer, GenericQueue, MpscQueue, MultiProducer, NonFifoMpmcQueue, Producer, QueuePolicy,
    SimpleQueuePolicy, SpmcQueue, SpscQueue, StringStreamPolicy, StringStreamQueue,
};
pub use intrusive::{IntrusiveMpscQueue, MpscNode};
