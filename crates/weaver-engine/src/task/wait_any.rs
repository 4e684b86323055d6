//! Composite waits over several awaitables.

use super::cancel::WakeupSource;
use super::current_task;
use super::handle::TaskWithResult;
use super::wait::{AccessorsWaitStrategy, ContextAccessor};
use crate::deadline::Deadline;
use crate::error::{TaskError, WaitInterruptedError};

/// Wait until any of `targets` is ready.
///
/// Returns the index of a ready target, `None` if `targets` is empty.
/// Must be called from a task.
pub fn wait_any(targets: &[&dyn ContextAccessor]) -> Result<Option<usize>, WaitInterruptedError> {
    wait_any_until(targets, Deadline::unreachable())
}

/// Wait until any of `targets` is ready or `deadline` expires.
///
/// Returns `None` on timeout.
pub fn wait_any_until(
    targets: &[&dyn ContextAccessor],
    deadline: Deadline,
) -> Result<Option<usize>, WaitInterruptedError> {
    if let Some(index) = first_ready(targets) {
        return Ok(Some(index));
    }
    if targets.is_empty() {
        return Ok(None);
    }
    let current = current_task::context();
    loop {
        let mut strategy = AccessorsWaitStrategy::new(&current, targets);
        let source = current.sleep(&mut strategy, deadline);
        if let Some(index) = first_ready(targets) {
            targets[index].after_wait();
            return Ok(Some(index));
        }
        match source {
            WakeupSource::CancelRequest => {
                return Err(WaitInterruptedError(current.cancellation_reason()))
            }
            WakeupSource::DeadlineTimer => return Ok(None),
            _ => {}
        }
    }
}

fn first_ready(targets: &[&dyn ContextAccessor]) -> Option<usize> {
    targets.iter().position(|target| target.is_ready())
}

/// Wait until every target is ready
pub fn wait_all(targets: &[&dyn ContextAccessor]) -> Result<(), WaitInterruptedError> {
    for target in targets {
        while !target.is_ready() {
            wait_any(std::slice::from_ref(target))?;
        }
    }
    Ok(())
}

/// Collect the results of `tasks` in order.
///
/// Returns as soon as any task fails; the remaining tasks are then
/// cancelled and awaited as their handles are dropped.
pub fn get_all<T>(tasks: Vec<TaskWithResult<T>>) -> Result<Vec<T>, TaskError>
where
    T: Send,
{
    let mut pending: Vec<Option<TaskWithResult<T>>> = tasks.into_iter().map(Some).collect();
    let mut results: Vec<Option<T>> = std::iter::repeat_with(|| None).take(pending.len()).collect();

    loop {
        for (slot, result) in pending.iter_mut().zip(results.iter_mut()) {
            if slot.as_ref().is_some_and(|task| task.is_ready()) {
                if let Some(task) = slot.take() {
                    *result = Some(task.get()?);
                }
            }
        }

        let waiting: Vec<&dyn ContextAccessor> = pending
            .iter()
            .flatten()
            .map(|task| task as &dyn ContextAccessor)
            .collect();
        if waiting.is_empty() {
            break;
        }
        wait_any(&waiting)?;
    }

    Ok(results.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TaskProcessorConfig;
    use crate::scheduler::TaskProcessor;
    use crate::task::{CancellationReason, TaskState};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_wait_any_returns_first_ready() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let index = processor
            .spawn(|| {
                let slow = current_task::spawn(|| {
                    current_task::interruptible_sleep_for(Duration::from_secs(5))
                });
                let fast = current_task::spawn(|| current_task::sleep_for(Duration::from_millis(5)));
                let targets: [&dyn ContextAccessor; 2] = [&slow, &fast];
                wait_any(&targets).unwrap()
            })
            .get()
            .unwrap();
        assert_eq!(index, Some(1));
    }

    #[test]
    fn test_wait_any_until_timeout() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        let result = processor
            .spawn(|| {
                let slow = current_task::spawn(|| {
                    current_task::interruptible_sleep_for(Duration::from_secs(5))
                });
                let targets: [&dyn ContextAccessor; 1] = [&slow];
                wait_any_until(&targets, Deadline::from_duration(Duration::from_millis(10)))
            })
            .get()
            .unwrap();
        assert_eq!(result, Ok(None));
    }

    #[test]
    fn test_wait_any_empty() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(1)).unwrap();
        assert_eq!(processor.spawn(|| wait_any(&[])).get().unwrap(), Ok(None));
    }

    #[test]
    fn test_get_all_in_order() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let values = processor
            .spawn(|| {
                let tasks = (0..5u64)
                    .map(|i| {
                        current_task::spawn(move || {
                            current_task::sleep_for(Duration::from_millis(10 - 2 * i));
                            i
                        })
                    })
                    .collect();
                get_all(tasks)
            })
            .get()
            .unwrap();
        assert_eq!(values, Ok(vec![0, 1, 2, 3, 4]));
    }

    #[test]
    fn test_get_all_fails_early_and_cancels_rest() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let observed = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = observed.clone();
        let (result, elapsed) = processor
            .spawn(move || {
                let started = Instant::now();
                let mut tasks: Vec<TaskWithResult<u32>> = (0..4)
                    .map(|_| {
                        let sink = sink.clone();
                        current_task::spawn(move || {
                            current_task::interruptible_sleep_for(Duration::from_secs(3600));
                            sink.lock().push(current_task::cancellation_reason());
                            0
                        })
                    })
                    .collect();
                tasks.push(current_task::spawn(|| -> u32 {
                    current_task::sleep_for(Duration::from_millis(5));
                    panic!("failed quickly")
                }));
                (get_all(tasks), started.elapsed())
            })
            .get()
            .unwrap();
        assert_eq!(result, Err(TaskError::Panicked("failed quickly".to_string())));
        assert!(elapsed < Duration::from_secs(10));
        let observed = observed.lock();
        assert_eq!(observed.len(), 4);
        assert!(observed.iter().all(|reason| *reason == CancellationReason::Abandoned));
    }

    #[test]
    fn test_get_all_interrupted() {
        let processor = TaskProcessor::new(TaskProcessorConfig::with_workers(2)).unwrap();
        let outer = processor.spawn(|| {
            let tasks = vec![current_task::spawn(|| {
                current_task::interruptible_sleep_for(Duration::from_secs(3600))
            })];
            get_all(tasks)
        });
        std::thread::sleep(Duration::from_millis(20));
        outer.request_cancel();
        outer.wait().unwrap();
        assert_eq!(outer.state(), TaskState::Completed);
        assert_eq!(
            outer.get().unwrap(),
            Err(TaskError::WaitInterrupted(CancellationReason::UserRequest))
        );
    }
}
