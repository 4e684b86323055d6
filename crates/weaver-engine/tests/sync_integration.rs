//! Integration tests combining synchronization primitives and queues
//! under a running task processor.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use weaver_engine::future::channel;
use weaver_engine::sync::RefillPolicy;
use weaver_engine::{
    current_task, ConditionVariable, FutureError, MpscQueue, Mutex, Semaphore,
    SingleConsumerEvent, TaskProcessor, TaskProcessorConfig, TokenBucket,
};

fn processor(workers: usize) -> TaskProcessor {
    TaskProcessor::new(TaskProcessorConfig::with_workers(workers))
        .expect("Failed to start task processor")
}

#[test]
fn test_semaphore_bounds_concurrency() {
    let processor = processor(4);
    let semaphore = Arc::new(Semaphore::new(3));
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let semaphore = semaphore.clone();
            let active = active.clone();
            let peak = peak.clone();
            processor.spawn(move || {
                let _guard = semaphore.acquire().unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                current_task::sleep_for(Duration::from_millis(2));
                active.fetch_sub(1, Ordering::SeqCst);
            })
        })
        .collect();
    for task in tasks {
        task.get().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(semaphore.used_approx(), 0);
}

#[test]
fn test_mpsc_pipeline() {
    let processor = processor(4);
    let queue = MpscQueue::with_max_size(8);
    let consumer = queue.get_consumer();
    let reader = processor.spawn(move || {
        let mut sum = 0u64;
        let mut count = 0;
        while let Some(value) = consumer.pop() {
            sum += value;
            count += 1;
        }
        (count, sum)
    });
    let writers: Vec<_> = (0..4u64)
        .map(|writer| {
            let producer = queue.get_multi_producer();
            processor.spawn(move || {
                for i in 0..250u64 {
                    producer.push(writer * 1000 + i).unwrap();
                }
            })
        })
        .collect();
    drop(queue);
    for writer in writers {
        writer.get().unwrap();
    }
    let expected: u64 = (0..4u64)
        .flat_map(|writer| (0..250u64).map(move |i| writer * 1000 + i))
        .sum();
    assert_eq!(reader.get(), Ok((1000, expected)));
}

#[test]
fn test_bounded_buffer_with_condition_variable() {
    const CAPACITY: usize = 4;
    let processor = processor(3);
    let state = Arc::new((Mutex::new(VecDeque::new()), ConditionVariable::new()));

    let producer = {
        let state = state.clone();
        processor.spawn(move || {
            let (buffer, cv) = &*state;
            for item in 0..100 {
                let mut guard = buffer.lock();
                assert!(cv.wait_pred(&mut guard, |items| items.len() < CAPACITY));
                guard.push_back(item);
                drop(guard);
                cv.notify_all();
            }
        })
    };
    let consumer = {
        let state = state.clone();
        processor.spawn(move || {
            let (buffer, cv) = &*state;
            let mut received = Vec::new();
            while received.len() < 100 {
                let mut guard = buffer.lock();
                assert!(cv.wait_pred(&mut guard, |items| !items.is_empty()));
                assert!(guard.len() <= CAPACITY);
                received.extend(guard.drain(..));
                drop(guard);
                cv.notify_all();
            }
            received
        })
    };
    producer.get().unwrap();
    assert_eq!(consumer.get().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_promise_chain_between_tasks() {
    let processor = processor(2);
    let (first_promise, first) = channel::<u32>();
    let (second_promise, second) = channel::<u32>();
    let middle = processor.spawn(move || {
        let value = first.get()?;
        second_promise.set_value(value * 2);
        Ok::<_, FutureError>(())
    });
    let last = processor.spawn(move || second.get());
    first_promise.set_value(21);
    assert_eq!(middle.get(), Ok(Ok(())));
    assert_eq!(last.get(), Ok(Ok(42)));
}

#[test]
fn test_broken_promise_propagates() {
    let processor = processor(2);
    let (promise, future) = channel::<u32>();
    let waiter = processor.spawn(move || future.get());
    let dropper = processor.spawn(move || {
        current_task::sleep_for(Duration::from_millis(5));
        drop(promise);
    });
    dropper.get().unwrap();
    assert_eq!(waiter.get(), Ok(Err(FutureError::PromiseBroken)));
}

#[test]
fn test_event_handshake() {
    let processor = processor(2);
    let ping = Arc::new(SingleConsumerEvent::new());
    let pong = Arc::new(SingleConsumerEvent::new());
    let responder = {
        let (ping, pong) = (ping.clone(), pong.clone());
        processor.spawn(move || {
            for _ in 0..10 {
                assert!(ping.wait_for_event());
                pong.send();
            }
        })
    };
    let initiator = processor.spawn(move || {
        for _ in 0..10 {
            ping.send();
            assert!(pong.wait_for_event());
        }
    });
    initiator.get().unwrap();
    responder.get().unwrap();
}

#[test]
fn test_token_bucket_throttles_tasks() {
    let processor = processor(2);
    let bucket = Arc::new(TokenBucket::new(
        5,
        RefillPolicy::new(1, Duration::from_secs(3600)),
    ));
    let granted = Arc::new(AtomicUsize::new(0));
    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let bucket = bucket.clone();
            let granted = granted.clone();
            processor.spawn(move || {
                if bucket.obtain() {
                    granted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for task in tasks {
        task.get().unwrap();
    }
    assert_eq!(granted.load(Ordering::SeqCst), 5);
}
