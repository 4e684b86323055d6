//! Task processor: consumer threads, task queues and the deadline timer

mod consumers;
mod counter;
mod global_queue;
mod processor;
mod task_queue;
mod timer;
mod work_stealing;
pub(crate) mod worker;

pub(crate) use processor::ProcessorShared;
pub(crate) use timer::TimerKey;
pub use processor::{ProcessorHandle, TaskProcessor, TaskProcessorStats};
