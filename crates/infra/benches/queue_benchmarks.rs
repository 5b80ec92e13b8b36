use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use devpulse_core::UserId;
use devpulse_infra::jobs::{
    HandlerRegistry, InMemoryJobStore, Job, JobId, JobOptions, JobPriority, JobStore, JobType,
    QueueManager, StaticFlag, WorkerId, WorkerPool, handler_fn,
};
use std::sync::Arc;
use std::time::Duration;

fn queue() -> QueueManager<InMemoryJobStore> {
    let registry = Arc::new(HandlerRegistry::new());
    for job_type in JobType::ALL {
        registry.register(job_type, handler_fn(|_| Ok(serde_json::Value::Null)));
    }
    QueueManager::new(InMemoryJobStore::new(), registry, Arc::new(StaticFlag::new(true)))
}

fn priority(i: usize) -> JobPriority {
    match i % 3 {
        0 => JobPriority::High,
        1 => JobPriority::Medium,
        _ => JobPriority::Low,
    }
}

fn bench_add_job(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_job");
    group.throughput(Throughput::Elements(1));

    group.bench_function("validated_admission", |b| {
        let queue = queue();
        let payload = serde_json::json!({"userId": UserId::new()});
        b.iter(|| {
            queue
                .add_job(
                    JobType::MetricsCalculation,
                    black_box(payload.clone()),
                    JobOptions::new(),
                )
                .unwrap()
        });
    });

    group.bench_function("deduplicated_admission", |b| {
        let queue = queue();
        let payload = serde_json::json!({"repositoryId": "r"});
        let id = JobId::for_target(JobType::TeamMetrics, "r:2024-05-01");
        b.iter(|| {
            queue
                .add_job(
                    JobType::TeamMetrics,
                    black_box(payload.clone()),
                    JobOptions::new().id(id.clone()),
                )
                .unwrap()
        });
    });

    group.finish();
}

fn bench_claim_order(c: &mut Criterion) {
    let mut group = c.benchmark_group("claim_next");
    let worker = WorkerId::new("bench");

    for backlog in [100usize, 1_000, 10_000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let store = InMemoryJobStore::new();
                    let now = Utc::now();
                    for i in 0..backlog {
                        let job = Job::new(
                            JobId::new(),
                            JobType::IncrementalSync,
                            serde_json::json!({"userId": "u"}),
                            priority(i),
                            3,
                            None,
                            now,
                        );
                        store.enqueue(job).unwrap();
                    }
                    store
                },
                |store| {
                    let now = Utc::now();
                    while let Some(job) = store.claim_next(&worker, Duration::from_secs(60), now).unwrap() {
                        black_box(job);
                    }
                },
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("drain");
    let worker = WorkerId::new("bench");

    for backlog in [100usize, 1_000] {
        group.throughput(Throughput::Elements(backlog as u64));
        group.bench_with_input(BenchmarkId::from_parameter(backlog), &backlog, |b, &backlog| {
            b.iter_batched(
                || {
                    let queue = queue();
                    for i in 0..backlog {
                        queue
                            .add_job(
                                JobType::IncrementalSync,
                                serde_json::json!({"userId": "u"}),
                                JobOptions::new().priority(priority(i)),
                            )
                            .unwrap();
                    }
                    queue
                },
                |queue| WorkerPool::drain(&queue, &worker).unwrap(),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_add_job, bench_claim_order, bench_drain);
criterion_main!(benches);
