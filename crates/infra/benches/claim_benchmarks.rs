use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use jobforge_core::{Job, RetryPolicy, ToolInput, ToolSlug};
use jobforge_infra::queue::{EnqueueOptions, InMemoryJobQueue, JobQueue};
use jobforge_infra::store::{InMemoryJobRecordStore, JobRecordStore};
use serde_json::json;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap()
}

fn slug() -> ToolSlug {
    ToolSlug::new("text-summary").unwrap()
}

/// Insert + claim of a fresh record, and a claim that loses to an earlier one.
fn bench_claim_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("claim_latency");

    group.bench_function("claim_fresh_record", |b| {
        let store = InMemoryJobRecordStore::new();
        b.iter(|| {
            rt.block_on(async {
                let job = Job::new(slug(), ToolInput::Opaque(json!({})));
                store.insert(&job).await.unwrap();
                black_box(store.claim(job.id, "m-1").await.unwrap())
            })
        });
    });

    group.bench_function("claim_conflict", |b| {
        let store = InMemoryJobRecordStore::new();
        let job = Job::new(slug(), ToolInput::Opaque(json!({})));
        rt.block_on(async {
            store.insert(&job).await.unwrap();
            store.claim(job.id, "m-1").await.unwrap();
        });
        b.iter(|| rt.block_on(async { black_box(store.claim(job.id, "m-2").await.unwrap()) }));
    });

    group.finish();
}

/// Enqueue then fetch a full batch from the in-memory queue.
fn bench_queue_fetch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("queue_fetch");

    for batch_size in [1usize, 10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            &batch_size,
            |b, &batch_size| {
                let queue = InMemoryJobQueue::new();
                b.iter(|| {
                    rt.block_on(async {
                        for _ in 0..batch_size {
                            let job = Job::new(slug(), ToolInput::Opaque(json!({})));
                            queue
                                .enqueue(&job.tool_slug, job.id, EnqueueOptions::default())
                                .await
                                .unwrap();
                        }
                        let batch = queue.fetch(&slug(), batch_size).await.unwrap();
                        for message in &batch {
                            queue.ack(&slug(), &message.id, &json!(null)).await.unwrap();
                        }
                        black_box(batch.len())
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_retry_delay(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(10, Duration::from_secs(60), Duration::from_secs(3600));
    c.bench_function("retry_delay_for_attempt", |b| {
        b.iter(|| {
            for attempt in 1..=10 {
                black_box(policy.delay_for_retry(black_box(attempt)));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_claim_latency,
    bench_queue_fetch,
    bench_retry_delay
);
criterion_main!(benches);
