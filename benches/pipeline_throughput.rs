//! rill benchmark suite.
//!
//! Benchmarks for element throughput:
//! - linear pipelines at different buffer sizes
//! - fan-out width over an async transform

use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use rill::{Pipeline, Stage, TransformError, from_fn, map};

const ELEMENTS: u64 = 10_000;

/// Five cheap stages; measures channel handoff cost per buffer size.
fn linear_benchmarks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("linear");
    group.throughput(Throughput::Elements(ELEMENTS));

    for buffer in [0usize, 1, 16, 256] {
        group.bench_with_input(BenchmarkId::new("five_stages", buffer), &buffer, |b, &buffer| {
            b.to_async(&rt).iter(|| async move {
                let pipeline = Pipeline::builder::<u64>("bench")
                    .stages((0..5).map(|n| Stage::new(format!("add-{n}"), map(|x: u64| x + 1))))
                    .default_buffer(buffer)
                    .build()
                    .unwrap();

                let out = pipeline.start_from_iter(0..ELEMENTS).unwrap();
                let collected = out.collect_all().await;
                pipeline.wait().await;
                collected.len()
            });
        });
    }

    group.finish();
}

/// One async stage with a short sleep, spread over N workers.
fn fan_out_benchmarks(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("fan_out");
    group.sample_size(10);

    let elements = 200u64;
    group.throughput(Throughput::Elements(elements));

    for workers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::new("sleepy", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async move {
                let stage = Stage::new(
                    "sleepy",
                    from_fn(|x: u64| async move {
                        tokio::time::sleep(Duration::from_micros(100)).await;
                        Ok::<_, TransformError>(x)
                    }),
                );
                let pipeline = Pipeline::builder::<u64>("bench")
                    .fan_out(stage, workers)
                    .default_buffer(16)
                    .build()
                    .unwrap();

                let out = pipeline.start_from_iter(0..elements).unwrap();
                let collected = out.collect_all().await;
                pipeline.wait().await;
                collected.len()
            });
        });
    }

    group.finish();
}

criterion_group!(benches, linear_benchmarks, fan_out_benchmarks);
criterion_main!(benches);
