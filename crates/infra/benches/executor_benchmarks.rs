use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use resaleops_infra::jobs::{
    BatchOptions, InMemoryJobStore, Job, JobExecutor, JobOutput, Priority, RetryPolicy,
};
use serde_json::json;
use tokio::runtime::Runtime;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
}

/// Jobs that finish immediately, so the measurement is dispatch overhead.
fn instant_jobs(count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| {
            let priority = match i % 4 {
                0 => Priority::Critical,
                1 => Priority::High,
                2 => Priority::Medium,
                _ => Priority::Low,
            };
            Job::new(format!("bench-{i}"), "bench", move |_ctx| async move {
                Ok(json!({ "n": i }))
            })
            .with_priority(priority)
            .with_retry_policy(RetryPolicy::none())
        })
        .collect()
}

fn bench_single_job_latency(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("single_job_latency");

    group.bench_function("run_job_with_timeout", |b| {
        let executor = JobExecutor::new(InMemoryJobStore::arc());
        b.iter(|| {
            let job = Job::new("latency", "latency", |_ctx| async { Ok(JobOutput::Null) });
            black_box(rt.block_on(executor.run_job_with_timeout(job)));
        });
    });

    group.finish();
}

fn bench_batch_dispatch(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("batch_dispatch");

    for batch_size in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));

        group.bench_with_input(
            BenchmarkId::new("unbounded", batch_size),
            batch_size,
            |b, &size| {
                let executor = JobExecutor::new(InMemoryJobStore::arc());
                b.iter(|| {
                    let summary = rt.block_on(
                        executor.execute_parallel(instant_jobs(size), BatchOptions::default()),
                    );
                    black_box(summary.successful);
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("bounded_10", batch_size),
            batch_size,
            |b, &size| {
                let executor = JobExecutor::new(InMemoryJobStore::arc());
                b.iter(|| {
                    let summary = rt.block_on(executor.execute_parallel(
                        instant_jobs(size),
                        BatchOptions::default().with_max_concurrent(10),
                    ));
                    black_box(summary.successful);
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_single_job_latency, bench_batch_dispatch);
criterion_main!(benches);
