//! Synthetic benchmark workloads
//!
//! Every workload does real, bounded work and is calibrated against a
//! reference device. Baseline tests (CPU, memory, storage) score around 2000
//! on the reference device, unclamped. Matrix, quantization and thermal tests
//! score 0-100.

use crate::ring::RingBuffer;
use anyhow::{Context, Result};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::hint::black_box;
use std::io::{Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Score the reference device gets on baseline tests
pub const BASELINE_REFERENCE_SCORE: f64 = 2000.0;

// Reference device throughput
const CPU_REFERENCE_OPS_PER_SEC: f64 = 50_000_000.0;
const MEMORY_REFERENCE_BYTES_PER_SEC: f64 = 10.0e9;
const LATENCY_REFERENCE_NS: f64 = 80.0;
const STORAGE_REFERENCE_BYTES_PER_SEC: f64 = 500.0e6;
const MATRIX_REFERENCE_GFLOPS: f64 = 4.0;

/// Benchmark tests in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkTestKind {
    CpuSingleCore,
    CpuMultiCore,
    MemoryBandwidth,
    MemoryLatency,
    StorageThroughput,
    Matrix64,
    Matrix128,
    Matrix256,
    Quantization,
    ThermalSustain,
}

impl BenchmarkTestKind {
    pub const ALL: [BenchmarkTestKind; 10] = [
        Self::CpuSingleCore,
        Self::CpuMultiCore,
        Self::MemoryBandwidth,
        Self::MemoryLatency,
        Self::StorageThroughput,
        Self::Matrix64,
        Self::Matrix128,
        Self::Matrix256,
        Self::Quantization,
        Self::ThermalSustain,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::CpuSingleCore => "CPU Single-Core",
            Self::CpuMultiCore => "CPU Multi-Core",
            Self::MemoryBandwidth => "Memory Bandwidth",
            Self::MemoryLatency => "Memory Latency",
            Self::StorageThroughput => "Storage Throughput",
            Self::Matrix64 => "Matrix Multiply 64",
            Self::Matrix128 => "Matrix Multiply 128",
            Self::Matrix256 => "Matrix Multiply 256",
            Self::Quantization => "Quantization Throughput",
            Self::ThermalSustain => "Thermal Sustain",
        }
    }

    /// Tests averaged into the aggregate score
    pub fn is_baseline(&self) -> bool {
        matches!(
            self,
            Self::CpuSingleCore
                | Self::CpuMultiCore
                | Self::MemoryBandwidth
                | Self::MemoryLatency
                | Self::StorageThroughput
        )
    }

    pub fn is_matrix(&self) -> bool {
        matches!(self, Self::Matrix64 | Self::Matrix128 | Self::Matrix256)
    }

    /// Score recorded when the test errors out
    pub fn degraded_score(&self) -> f64 {
        if self.is_baseline() { 500.0 } else { 25.0 }
    }
}

/// Raw outcome of one test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestOutcome {
    pub kind: BenchmarkTestKind,
    pub score: f64,
    #[serde(default)]
    pub details: serde_json::Value,
    /// The workload failed and `score` is a fallback
    #[serde(default)]
    pub degraded: bool,
    pub duration_ms: u64,
}

/// Work sizes for each workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSizes {
    pub cpu_iterations: u64,
    pub memory_bytes: usize,
    pub latency_nodes: usize,
    pub latency_steps: usize,
    pub storage_bytes: usize,
    pub quantization_elements: usize,
}

impl Default for WorkloadSizes {
    fn default() -> Self {
        Self {
            cpu_iterations: 20_000_000,
            memory_bytes: 64 * 1024 * 1024,
            latency_nodes: 4 * 1024 * 1024,
            latency_steps: 2_000_000,
            storage_bytes: 32 * 1024 * 1024,
            quantization_elements: 4 * 1024 * 1024,
        }
    }
}

impl WorkloadSizes {
    /// Tiny sizes for tests and dry runs
    pub fn quick() -> Self {
        Self {
            cpu_iterations: 20_000,
            memory_bytes: 256 * 1024,
            latency_nodes: 4096,
            latency_steps: 10_000,
            storage_bytes: 256 * 1024,
            quantization_elements: 16 * 1024,
        }
    }
}

fn rate(units: f64, elapsed: Duration) -> f64 {
    units / elapsed.as_secs_f64().max(1e-9)
}

fn scale_baseline(measured: f64, reference: f64) -> f64 {
    (measured / reference * BASELINE_REFERENCE_SCORE).round()
}

fn cpu_kernel(iterations: u64) -> f64 {
    let mut acc = 0.0f64;
    for i in 0..iterations {
        let x = i as f64;
        acc += x.sqrt() * x.sin() * x.cos();
    }
    black_box(acc)
}

/// Single-threaded floating point loop
pub fn cpu_single_core(sizes: &WorkloadSizes) -> Result<(f64, serde_json::Value)> {
    let start = Instant::now();
    cpu_kernel(sizes.cpu_iterations);
    let ops_per_sec = rate(sizes.cpu_iterations as f64, start.elapsed());

    Ok((
        scale_baseline(ops_per_sec, CPU_REFERENCE_OPS_PER_SEC),
        json!({ "ops_per_sec": ops_per_sec }),
    ))
}

/// Same loop on every core; scored per core so the reference stays comparable
pub fn cpu_multi_core(sizes: &WorkloadSizes) -> Result<(f64, serde_json::Value)> {
    let threads = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let start = Instant::now();
    std::thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(|| cpu_kernel(sizes.cpu_iterations));
        }
    });
    let elapsed = start.elapsed();

    let total_ops = sizes.cpu_iterations as f64 * threads as f64;
    let ops_per_sec = rate(total_ops, elapsed);
    // Four reference cores
    let score = scale_baseline(ops_per_sec, CPU_REFERENCE_OPS_PER_SEC * 4.0);

    Ok((
        score,
        json!({ "threads": threads, "ops_per_sec": ops_per_sec }),
    ))
}

/// Sequential write then read over a large buffer
pub fn memory_bandwidth(sizes: &WorkloadSizes) -> Result<(f64, serde_json::Value)> {
    let words = (sizes.memory_bytes / 8).max(1);

    let start = Instant::now();
    let mut buffer = vec![0u64; words];
    for (i, word) in buffer.iter_mut().enumerate() {
        *word = i as u64;
    }
    let sum: u64 = buffer.iter().fold(0u64, |acc, w| acc.wrapping_add(*w));
    black_box(sum);
    let elapsed = start.elapsed();

    // One write pass and one read pass
    let bytes_per_sec = rate((words * 8 * 2) as f64, elapsed);
    Ok((
        scale_baseline(bytes_per_sec, MEMORY_REFERENCE_BYTES_PER_SEC),
        json!({ "bytes_per_sec": bytes_per_sec, "buffer_bytes": words * 8 }),
    ))
}

/// Pointer chase over a random single-cycle permutation
pub fn memory_latency(sizes: &WorkloadSizes) -> Result<(f64, serde_json::Value)> {
    let nodes = sizes.latency_nodes.max(2);
    let mut order: Vec<usize> = (0..nodes).collect();
    order.shuffle(&mut StdRng::seed_from_u64(0x5eed));

    let mut next = vec![0usize; nodes];
    for window in 0..nodes {
        next[order[window]] = order[(window + 1) % nodes];
    }

    let start = Instant::now();
    let mut cursor = order[0];
    for _ in 0..sizes.latency_steps {
        cursor = next[cursor];
    }
    black_box(cursor);
    let elapsed = start.elapsed();

    let ns_per_access = elapsed.as_nanos() as f64 / sizes.latency_steps.max(1) as f64;
    let score = (LATENCY_REFERENCE_NS / ns_per_access.max(0.01) * BASELINE_REFERENCE_SCORE).round();

    Ok((score, json!({ "ns_per_access": ns_per_access, "nodes": nodes })))
}

/// Write, sync and read back a scratch file
pub fn storage_throughput(
    sizes: &WorkloadSizes,
    scratch_dir: &Path,
) -> Result<(f64, serde_json::Value)> {
    std::fs::create_dir_all(scratch_dir)
        .with_context(|| format!("Failed to create scratch dir: {:?}", scratch_dir))?;
    let path = scratch_dir.join("storage-benchmark.bin");

    let chunk = vec![0xA5u8; 1024 * 1024];
    let total = sizes.storage_bytes.max(1);

    let result = (|| -> Result<Duration> {
        let start = Instant::now();
        {
            let mut file = std::fs::File::create(&path)?;
            let mut written = 0;
            while written < total {
                let n = chunk.len().min(total - written);
                file.write_all(&chunk[..n])?;
                written += n;
            }
            file.sync_all()?;
        }

        let mut file = std::fs::File::open(&path)?;
        let mut buf = vec![0u8; chunk.len()];
        let mut read = 0;
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            read += n;
        }
        black_box(read);
        Ok(start.elapsed())
    })();

    // Remove the scratch file whatever happened
    let _ = std::fs::remove_file(&path);
    let elapsed = result.context("Storage workload failed")?;

    let bytes_per_sec = rate((total * 2) as f64, elapsed);
    Ok((
        scale_baseline(bytes_per_sec, STORAGE_REFERENCE_BYTES_PER_SEC),
        json!({ "bytes_per_sec": bytes_per_sec, "file_bytes": total }),
    ))
}

/// Dense f32 matrix multiply, scored 0-100 against reference GFLOPS
pub fn matrix_multiply(n: usize) -> Result<(f64, serde_json::Value)> {
    let a: Vec<f32> = (0..n * n).map(|i| (i % 7) as f32 * 0.5).collect();
    let b: Vec<f32> = (0..n * n).map(|i| (i % 5) as f32 * 0.25).collect();
    let mut c = vec![0.0f32; n * n];

    let start = Instant::now();
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            let row_b = &b[k * n..(k + 1) * n];
            let row_c = &mut c[i * n..(i + 1) * n];
            for (dst, src) in row_c.iter_mut().zip(row_b) {
                *dst += aik * src;
            }
        }
    }
    black_box(&c);
    let elapsed = start.elapsed();

    let gflops = rate(2.0 * (n as f64).powi(3), elapsed) / 1e9;
    let score = (gflops / MATRIX_REFERENCE_GFLOPS * 100.0).clamp(0.0, 100.0);

    Ok((score, json!({ "size": n, "gflops": gflops })))
}

/// Element throughput per precision, in elements per second
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PrecisionThroughput {
    pub fp32: f64,
    pub int8: f64,
    pub int4: f64,
}

impl PrecisionThroughput {
    /// Reduced precisions that run at least a quarter as fast as fp32
    pub fn usable_int8(&self) -> bool {
        self.int8 >= self.fp32 * 0.25
    }

    pub fn usable_int4(&self) -> bool {
        self.int4 >= self.fp32 * 0.25
    }
}

/// Dot products in fp32, int8 and packed int4
pub fn quantization_throughput(sizes: &WorkloadSizes) -> Result<PrecisionThroughput> {
    let n = sizes.quantization_elements.max(2) & !1;

    let fa: Vec<f32> = (0..n).map(|i| (i % 13) as f32 - 6.0).collect();
    let fb: Vec<f32> = (0..n).map(|i| (i % 11) as f32 - 5.0).collect();
    let start = Instant::now();
    let dot: f32 = fa.iter().zip(&fb).map(|(x, y)| x * y).sum();
    black_box(dot);
    let fp32 = rate(n as f64, start.elapsed());

    let ia: Vec<i8> = (0..n).map(|i| ((i % 13) as i8) - 6).collect();
    let ib: Vec<i8> = (0..n).map(|i| ((i % 11) as i8) - 5).collect();
    let start = Instant::now();
    let dot: i32 = ia.iter().zip(&ib).map(|(x, y)| *x as i32 * *y as i32).sum();
    black_box(dot);
    let int8 = rate(n as f64, start.elapsed());

    // Two signed nibbles per byte
    let pa: Vec<u8> = (0..n / 2).map(|i| (i % 251) as u8).collect();
    let pb: Vec<u8> = (0..n / 2).map(|i| (i % 241) as u8).collect();
    let start = Instant::now();
    let mut dot = 0i32;
    for (x, y) in pa.iter().zip(&pb) {
        let (xl, xh) = (nibble(*x & 0x0f), nibble(*x >> 4));
        let (yl, yh) = (nibble(*y & 0x0f), nibble(*y >> 4));
        dot += xl * yl + xh * yh;
    }
    black_box(dot);
    let int4 = rate(n as f64, start.elapsed());

    Ok(PrecisionThroughput { fp32, int8, int4 })
}

fn nibble(v: u8) -> i32 {
    // Sign-extend a 4-bit value
    ((v as i8) << 4 >> 4) as i32
}

/// Outcome of the thermal test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermalReport {
    /// Sustained-to-initial throughput ratio as 0-100
    pub score: f64,
    pub samples: Vec<f64>,
}

/// Why a thermal run ended early
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalError {
    Abandoned,
}

/// Most samples a thermal run takes, whatever the window
pub const MAX_THERMAL_SAMPLES: usize = 720;

/// Samples taken over `window`, at least one and at most [`MAX_THERMAL_SAMPLES`]
pub fn thermal_sample_count(window: Duration, interval: Duration) -> usize {
    (window.as_nanos() / interval.as_nanos().max(1)).clamp(1, MAX_THERMAL_SAMPLES as u128) as usize
}

/// Sample a short CPU burst every `interval` over `window`
///
/// Throttling shows up as later samples running slower than the first.
/// Returns `Abandoned` as soon as `cancel` fires.
pub async fn thermal_sustain(
    window: Duration,
    interval: Duration,
    burst_iterations: u64,
    cancel: &CancellationToken,
) -> Result<ThermalReport, ThermalError> {
    let sample_count = thermal_sample_count(window, interval);
    let mut samples = RingBuffer::new(sample_count);

    for index in 0..sample_count {
        if index > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ThermalError::Abandoned),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        if cancel.is_cancelled() {
            return Err(ThermalError::Abandoned);
        }

        let start = Instant::now();
        let burst = tokio::task::spawn_blocking(move || cpu_kernel(burst_iterations)).await;
        if burst.is_err() {
            return Err(ThermalError::Abandoned);
        }
        samples.push(rate(burst_iterations as f64, start.elapsed()));
    }

    let samples = samples.to_vec();
    Ok(ThermalReport {
        score: sustain_score(&samples),
        samples,
    })
}

/// Mean of the last third of samples relative to the first, as 0-100
pub fn sustain_score(samples: &[f64]) -> f64 {
    let Some(&first) = samples.first() else {
        return 0.0;
    };
    if first <= 0.0 {
        return 0.0;
    }

    let tail_len = (samples.len() / 3).max(1);
    let tail = &samples[samples.len() - tail_len..];
    let tail_mean = tail.iter().sum::<f64>() / tail.len() as f64;

    (tail_mean / first * 100.0).clamp(0.0, 100.0)
}
