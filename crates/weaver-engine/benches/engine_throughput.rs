use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use weaver_engine::{
    current_task, get_all, Mutex, SpscQueue, TaskProcessor, TaskProcessorConfig, TaskQueueType,
};

fn processor(queue: TaskQueueType, workers: usize) -> TaskProcessor {
    let config = TaskProcessorConfig {
        task_queue: queue,
        ..TaskProcessorConfig::with_workers(workers)
    };
    TaskProcessor::new(config).unwrap()
}

fn bench_spawn_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn_get");
    group.throughput(Throughput::Elements(1000));

    for queue in [TaskQueueType::GlobalTaskQueue, TaskQueueType::WorkStealingTaskQueue] {
        let processor = processor(queue, 4);
        group.bench_with_input(
            BenchmarkId::new("tasks_1000", format!("{:?}", queue)),
            &processor,
            |b, processor| {
                b.iter(|| {
                    let tasks: Vec<_> = (0..1000u64)
                        .map(|i| processor.spawn(move || black_box(i)))
                        .collect();
                    for task in tasks {
                        task.get().unwrap();
                    }
                });
            },
        );
    }

    group.finish();
}

fn bench_nested_spawn(c: &mut Criterion) {
    let processor = processor(TaskQueueType::WorkStealingTaskQueue, 4);

    c.bench_function("nested_spawn_get_all", |b| {
        b.iter(|| {
            processor
                .spawn(|| {
                    let tasks: Vec<_> = (0..256u64)
                        .map(|i| current_task::spawn(move || black_box(i) * 2))
                        .collect();
                    get_all(tasks).unwrap().len()
                })
                .get()
                .unwrap()
        });
    });
}

fn bench_yield(c: &mut Criterion) {
    let processor = processor(TaskQueueType::WorkStealingTaskQueue, 2);

    c.bench_function("yield_1000", |b| {
        b.iter(|| {
            processor
                .spawn(|| {
                    for _ in 0..1000 {
                        current_task::yield_now();
                    }
                })
                .get()
                .unwrap()
        });
    });
}

fn bench_mutex_contention(c: &mut Criterion) {
    let processor = processor(TaskQueueType::WorkStealingTaskQueue, 4);
    let mutex = Arc::new(Mutex::new(0u64));

    c.bench_function("mutex_8_tasks_x_100", |b| {
        b.iter(|| {
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let mutex = mutex.clone();
                    processor.spawn(move || {
                        for _ in 0..100 {
                            *mutex.lock() += 1;
                        }
                    })
                })
                .collect();
            for task in tasks {
                task.get().unwrap();
            }
        });
    });
}

fn bench_spsc_queue(c: &mut Criterion) {
    let processor = processor(TaskQueueType::WorkStealingTaskQueue, 2);
    let mut group = c.benchmark_group("spsc_queue");
    group.throughput(Throughput::Elements(10_000));

    group.bench_function("push_pop_10000", |b| {
        b.iter(|| {
            let queue = SpscQueue::with_max_size(64);
            let producer = queue.get_producer();
            let consumer = queue.get_consumer();
            let reader = processor.spawn(move || {
                let mut count = 0u64;
                while consumer.pop().is_some() {
                    count += 1;
                }
                count
            });
            processor
                .spawn(move || {
                    for i in 0..10_000u64 {
                        producer.push(i).unwrap();
                    }
                })
                .get()
                .unwrap();
            reader.get().unwrap()
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_spawn_get,
    bench_nested_spawn,
    bench_yield,
    bench_mutex_contention,
    bench_spsc_queue
);
criterion_main!(benches);
