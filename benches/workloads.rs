//! Benchmark workload cost
//!
//! Measures how long the synthetic workloads themselves take, so the
//! default sizes keep a full run within a few minutes.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use offlaine_manager::capability::WorkloadSizes;
use offlaine_manager::capability::workloads::{
    matrix_multiply, memory_latency, quantization_throughput, sustain_score,
};
use std::hint::black_box;

fn bench_matrix(c: &mut Criterion) {
    let mut group = c.benchmark_group("matrix_multiply");
    group.sample_size(20);

    for n in [64, 128] {
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, n| {
            b.iter(|| matrix_multiply(black_box(*n)).unwrap())
        });
    }

    group.finish();
}

fn bench_quick_workloads(c: &mut Criterion) {
    let sizes = WorkloadSizes::quick();

    c.bench_function("memory_latency_quick", |b| {
        b.iter(|| memory_latency(black_box(&sizes)).unwrap())
    });
    c.bench_function("quantization_quick", |b| {
        b.iter(|| quantization_throughput(black_box(&sizes)).unwrap())
    });
}

fn bench_sustain_score(c: &mut Criterion) {
    let samples: Vec<f64> = (0..18).map(|i| 1000.0 - i as f64 * 12.5).collect();

    c.bench_function("sustain_score", |b| b.iter(|| sustain_score(black_box(&samples))));
}

criterion_group!(benches, bench_matrix, bench_quick_workloads, bench_sustain_score);
criterion_main!(benches);
