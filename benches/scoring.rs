//! Scoring path benchmarks
//!
//! Benchmarks for the pure functions applied after a benchmark run:
//! - Tier classification
//! - AI-capability scoring over test outcomes
//! - Recommendation ranking per tier

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use offlaine_manager::capability::runner::{aggregate, ai_score};
use offlaine_manager::capability::{
    AcceleratorInfo, BenchmarkTestKind, PerformanceTier, RecommendationEngine, TestOutcome,
    classify,
};
use std::hint::black_box;

fn outcomes() -> Vec<TestOutcome> {
    BenchmarkTestKind::ALL
        .iter()
        .map(|kind| TestOutcome {
            kind: *kind,
            score: if kind.is_baseline() { 1800.0 } else { 60.0 },
            details: serde_json::Value::Null,
            degraded: false,
            duration_ms: 0,
        })
        .collect()
}

fn bench_classify(c: &mut Criterion) {
    c.bench_function("classify", |b| {
        b.iter(|| classify(black_box(1450.0), black_box(6144), black_box(6)))
    });
}

fn bench_ai_score(c: &mut Criterion) {
    let tests = outcomes();
    let accelerator = AcceleratorInfo::none();

    c.bench_function("aggregate_and_ai_score", |b| {
        b.iter(|| {
            let aggregate = aggregate(black_box(&tests));
            let ai = ai_score(black_box(&tests), Some(66.0), &accelerator);
            (aggregate, ai)
        })
    });
}

fn bench_recommend(c: &mut Criterion) {
    let engine = RecommendationEngine::default();
    let accelerator = AcceleratorInfo {
        supports_int4: true,
        ..AcceleratorInfo::none()
    };
    let mut group = c.benchmark_group("recommend");

    for tier in [PerformanceTier::Low, PerformanceTier::Medium, PerformanceTier::High] {
        group.bench_with_input(BenchmarkId::from_parameter(tier), &tier, |b, tier| {
            b.iter(|| engine.recommend(*tier, black_box(85.0), &accelerator))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_classify, bench_ai_score, bench_recommend);
criterion_main!(benches);
