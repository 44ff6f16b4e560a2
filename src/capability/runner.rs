//! Benchmark orchestration, scoring and result caching

use super::accelerator::{self, AcceleratorInfo};
use super::recommend::{ModelRecommendation, RecommendationEngine};
use super::tier::{self, PerformanceTier};
use super::workloads::{self, BenchmarkTestKind, TestOutcome, ThermalError, WorkloadSizes};
use crate::device::{DeviceFacts, DeviceProbe};
use crate::error::{ManagerError, ManagerResult};
use crate::metrics;
use crate::store::{BENCHMARK_CACHE_KEY, RecordStore};
use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const MATRIX_WEIGHT: f64 = 0.35;
const BANDWIDTH_WEIGHT: f64 = 0.25;
const QUANTIZATION_WEIGHT: f64 = 0.25;
const THERMAL_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone)]
pub struct BenchmarkSettings {
    pub thermal_window: Duration,
    pub thermal_interval: Duration,
    /// Where the storage workload writes its scratch file
    pub scratch_dir: PathBuf,
    pub sizes: WorkloadSizes,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            thermal_window: Duration::from_secs(180),
            thermal_interval: Duration::from_secs(10),
            scratch_dir: std::env::temp_dir().join("offlaine-benchmark"),
            sizes: WorkloadSizes::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub device: DeviceFacts,
    pub accelerator: AcceleratorInfo,
    pub tests: Vec<TestOutcome>,
    /// Mean of the baseline tests, around 2000 on the reference device
    pub aggregate_score: f64,
    /// 0-100
    pub ai_score: f64,
    /// Blended tier input in [0, 1]
    pub overall: f64,
    pub tier: PerformanceTier,
    pub recommendations: Vec<ModelRecommendation>,
    pub completed_at: DateTime<Utc>,
    /// At least one test fell back to a degraded score
    pub degraded: bool,
}

/// Cached benchmark outcome
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BenchmarkStatus {
    #[default]
    NeverRun,
    Completed(Box<BenchmarkResult>),
    Failed {
        error: String,
        failed_at: DateTime<Utc>,
    },
}

/// Clears the running flag when a run ends, however it ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Runs the benchmark battery, one run at a time
pub struct BenchmarkRunner {
    records: RecordStore,
    probe: Arc<dyn DeviceProbe>,
    engine: RecommendationEngine,
    settings: BenchmarkSettings,
    running: AtomicBool,
}

impl BenchmarkRunner {
    pub fn new(
        records: RecordStore,
        probe: Arc<dyn DeviceProbe>,
        engine: RecommendationEngine,
        settings: BenchmarkSettings,
    ) -> Self {
        Self {
            records,
            probe,
            engine,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn engine(&self) -> &RecommendationEngine {
        &self.engine
    }

    /// Run every test in order and cache the result
    ///
    /// `on_progress` receives the completed fraction and the name of the test
    /// that just finished. Cancelling `cancel` abandons the run and leaves the
    /// cache untouched.
    pub async fn run<F>(
        &self,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> ManagerResult<BenchmarkResult>
    where
        F: FnMut(f64, &str) + Send,
    {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ManagerError::BenchmarkInProgress);
        }
        let _guard = RunGuard(&self.running);

        tracing::info!("Starting device benchmark");

        let facts = match self.probe.facts().await {
            Ok(facts) => facts,
            Err(e) => {
                tracing::error!(error = %e, "Device probe failed");
                self.store_status(&BenchmarkStatus::Failed {
                    error: format!("{:#}", e),
                    failed_at: Utc::now(),
                })
                .await?;
                metrics::record_benchmark_run("failed");
                return Err(ManagerError::Storage(e.context("Device probe failed")));
            }
        };
        let accelerator = accelerator::detect(&facts);

        let total = BenchmarkTestKind::ALL.len();
        let mut tests = Vec::with_capacity(total);
        let mut quantization_breadth = None;

        for (index, kind) in BenchmarkTestKind::ALL.into_iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(self.abandoned());
            }

            let start = Instant::now();
            let measured = match kind {
                BenchmarkTestKind::ThermalSustain => {
                    let burst = (self.settings.sizes.cpu_iterations / 10).max(1);
                    match workloads::thermal_sustain(
                        self.settings.thermal_window,
                        self.settings.thermal_interval,
                        burst,
                        cancel,
                    )
                    .await
                    {
                        Ok(report) => Ok((report.score, json!({ "samples": report.samples }))),
                        Err(ThermalError::Abandoned) => return Err(self.abandoned()),
                    }
                }
                BenchmarkTestKind::Quantization => {
                    self.run_blocking(kind).await.map(|(_, details)| {
                        let breadth = quantization_breadth_from(&details, &accelerator);
                        quantization_breadth = Some(breadth);
                        (breadth, details)
                    })
                }
                _ => self.run_blocking(kind).await,
            };

            let outcome = match measured {
                Ok((score, details)) => TestOutcome {
                    kind,
                    score,
                    details,
                    degraded: false,
                    duration_ms: start.elapsed().as_millis() as u64,
                },
                Err(e) => {
                    tracing::warn!(
                        test = kind.name(),
                        error = %e,
                        fallback = kind.degraded_score(),
                        "Benchmark test failed, using degraded score"
                    );
                    TestOutcome {
                        kind,
                        score: kind.degraded_score(),
                        details: json!({ "error": format!("{:#}", e) }),
                        degraded: true,
                        duration_ms: start.elapsed().as_millis() as u64,
                    }
                }
            };
            tracing::debug!(test = kind.name(), score = outcome.score, "Benchmark test finished");
            tests.push(outcome);

            on_progress((index + 1) as f64 / total as f64, kind.name());
        }

        let aggregate_score = aggregate(&tests);
        let ai_score = ai_score(&tests, quantization_breadth, &accelerator);
        let overall = tier::overall_score(aggregate_score, facts.total_memory_mb, facts.cpu_cores);
        let tier = tier::tier_for_overall(overall);
        let recommendations = self.engine.recommend(tier, ai_score, &accelerator);

        let result = BenchmarkResult {
            degraded: tests.iter().any(|t| t.degraded),
            device: facts,
            accelerator,
            tests,
            aggregate_score,
            ai_score,
            overall,
            tier,
            recommendations,
            completed_at: Utc::now(),
        };

        self.store_status(&BenchmarkStatus::Completed(Box::new(result.clone())))
            .await?;
        metrics::record_benchmark_run("completed");

        tracing::info!(
            aggregate = result.aggregate_score,
            ai_score = result.ai_score,
            tier = %result.tier,
            degraded = result.degraded,
            "Device benchmark completed"
        );
        Ok(result)
    }

    /// Cached outcome of the last run
    pub async fn status(&self) -> ManagerResult<BenchmarkStatus> {
        Ok(self
            .records
            .get::<BenchmarkStatus>(BENCHMARK_CACHE_KEY)
            .await?
            .unwrap_or_default())
    }

    pub async fn cached_result(&self) -> ManagerResult<Option<BenchmarkResult>> {
        Ok(match self.status().await? {
            BenchmarkStatus::Completed(result) => Some(*result),
            _ => None,
        })
    }

    pub async fn clear_cache(&self) -> ManagerResult<()> {
        self.records.delete(BENCHMARK_CACHE_KEY).await?;
        tracing::info!("Cleared benchmark cache");
        Ok(())
    }

    async fn run_blocking(
        &self,
        kind: BenchmarkTestKind,
    ) -> anyhow::Result<(f64, serde_json::Value)> {
        let sizes = self.settings.sizes.clone();
        let scratch_dir = self.settings.scratch_dir.clone();

        tokio::task::spawn_blocking(move || match kind {
            BenchmarkTestKind::CpuSingleCore => workloads::cpu_single_core(&sizes),
            BenchmarkTestKind::CpuMultiCore => workloads::cpu_multi_core(&sizes),
            BenchmarkTestKind::MemoryBandwidth => workloads::memory_bandwidth(&sizes),
            BenchmarkTestKind::MemoryLatency => workloads::memory_latency(&sizes),
            BenchmarkTestKind::StorageThroughput => {
                workloads::storage_throughput(&sizes, &scratch_dir)
            }
            BenchmarkTestKind::Matrix64 => workloads::matrix_multiply(64),
            BenchmarkTestKind::Matrix128 => workloads::matrix_multiply(128),
            BenchmarkTestKind::Matrix256 => workloads::matrix_multiply(256),
            BenchmarkTestKind::Quantization => {
                let rates = workloads::quantization_throughput(&sizes)?;
                Ok((0.0, serde_json::to_value(rates)?))
            }
            BenchmarkTestKind::ThermalSustain => {
                anyhow::bail!("Thermal test does not run on the blocking pool")
            }
        })
        .await
        .with_context(|| format!("{} task panicked", kind.name()))?
    }

    fn abandoned(&self) -> ManagerError {
        tracing::warn!("Benchmark abandoned, nothing cached");
        metrics::record_benchmark_run("abandoned");
        ManagerError::BenchmarkAbandoned
    }

    async fn store_status(&self, status: &BenchmarkStatus) -> ManagerResult<()> {
        self.records
            .set(BENCHMARK_CACHE_KEY, status)
            .await
            .context("Failed to cache benchmark status")?;
        Ok(())
    }
}

/// Mean of the baseline test scores
pub fn aggregate(tests: &[TestOutcome]) -> f64 {
    let baselines: Vec<f64> = tests
        .iter()
        .filter(|t| t.kind.is_baseline())
        .map(|t| t.score)
        .collect();
    if baselines.is_empty() {
        return 0.0;
    }
    baselines.iter().sum::<f64>() / baselines.len() as f64
}

/// Share of int8, int4 and fp16 the device can use, as 0-100
///
/// Reduced integer precisions count when measured usable or declared by the
/// accelerator. fp16 only counts when declared.
fn quantization_breadth_from(details: &serde_json::Value, accelerator: &AcceleratorInfo) -> f64 {
    let measured: Option<workloads::PrecisionThroughput> =
        serde_json::from_value(details.clone()).ok();

    let int8 = accelerator.supports_int8 || measured.is_some_and(|m| m.usable_int8());
    let int4 = accelerator.supports_int4 || measured.is_some_and(|m| m.usable_int4());
    let fp16 = accelerator.supports_fp16;

    let available = [int8, int4, fp16].iter().filter(|s| **s).count();
    100.0 * available as f64 / 3.0
}

/// Weighted AI-capability score plus accelerator bonus, clamped to 0-100
pub fn ai_score(
    tests: &[TestOutcome],
    quantization_breadth: Option<f64>,
    accelerator: &AcceleratorInfo,
) -> f64 {
    let score_of = |kind: BenchmarkTestKind| {
        tests
            .iter()
            .find(|t| t.kind == kind)
            .map(|t| t.score)
            .unwrap_or(0.0)
    };

    let matrix: Vec<f64> = tests
        .iter()
        .filter(|t| t.kind.is_matrix())
        .map(|t| t.score)
        .collect();
    let matrix_mean = if matrix.is_empty() {
        0.0
    } else {
        matrix.iter().sum::<f64>() / matrix.len() as f64
    };

    let bandwidth = (score_of(BenchmarkTestKind::MemoryBandwidth)
        / workloads::BASELINE_REFERENCE_SCORE
        * 100.0)
        .clamp(0.0, 100.0);
    let quantization =
        quantization_breadth.unwrap_or_else(|| score_of(BenchmarkTestKind::Quantization));
    let thermal = score_of(BenchmarkTestKind::ThermalSustain);

    let raw = MATRIX_WEIGHT * matrix_mean
        + BANDWIDTH_WEIGHT * bandwidth
        + QUANTIZATION_WEIGHT * quantization
        + THERMAL_WEIGHT * thermal
        + accelerator.kind.bonus();
    raw.clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::AcceleratorKind;
    use crate::device::StaticDeviceProbe;
    use crate::store::MemoryKvStore;
    use async_trait::async_trait;
    use tempfile::TempDir;

    fn outcome(kind: BenchmarkTestKind, score: f64) -> TestOutcome {
        TestOutcome {
            kind,
            score,
            details: serde_json::Value::Null,
            degraded: false,
            duration_ms: 0,
        }
    }

    fn quick_runner(probe: Arc<dyn DeviceProbe>, scratch: &TempDir) -> BenchmarkRunner {
        let records = RecordStore::new(Arc::new(MemoryKvStore::new()));
        BenchmarkRunner::new(
            records,
            probe,
            RecommendationEngine::default(),
            BenchmarkSettings {
                thermal_window: Duration::from_millis(30),
                thermal_interval: Duration::from_millis(10),
                scratch_dir: scratch.path().to_path_buf(),
                sizes: WorkloadSizes::quick(),
            },
        )
    }

    #[test]
    fn test_aggregate_is_baseline_mean() {
        let tests = vec![
            outcome(BenchmarkTestKind::CpuSingleCore, 1000.0),
            outcome(BenchmarkTestKind::CpuMultiCore, 2000.0),
            outcome(BenchmarkTestKind::MemoryBandwidth, 3000.0),
            outcome(BenchmarkTestKind::MemoryLatency, 1000.0),
            outcome(BenchmarkTestKind::StorageThroughput, 3000.0),
            outcome(BenchmarkTestKind::Matrix64, 99.0),
        ];
        assert_eq!(aggregate(&tests), 2000.0);
        assert_eq!(aggregate(&[]), 0.0);
    }

    #[test]
    fn test_ai_score_weights() {
        let tests = vec![
            outcome(BenchmarkTestKind::MemoryBandwidth, 1000.0),
            outcome(BenchmarkTestKind::Matrix64, 40.0),
            outcome(BenchmarkTestKind::Matrix128, 40.0),
            outcome(BenchmarkTestKind::Matrix256, 40.0),
            outcome(BenchmarkTestKind::ThermalSustain, 100.0),
        ];
        // 0.35*40 + 0.25*50 + 0.25*0 + 0.15*100 = 41.5
        let score = ai_score(&tests, Some(0.0), &AcceleratorInfo::none());
        assert!((score - 41.5).abs() < 1e-9);

        let npu = AcceleratorInfo {
            kind: AcceleratorKind::Npu,
            ..AcceleratorInfo::none()
        };
        assert!((ai_score(&tests, Some(0.0), &npu) - 61.5).abs() < 1e-9);
    }

    #[test]
    fn test_ai_score_clamped() {
        let tests = vec![
            outcome(BenchmarkTestKind::MemoryBandwidth, 10_000.0),
            outcome(BenchmarkTestKind::Matrix64, 100.0),
            outcome(BenchmarkTestKind::ThermalSustain, 100.0),
        ];
        let npu = AcceleratorInfo {
            kind: AcceleratorKind::Npu,
            ..AcceleratorInfo::none()
        };
        assert_eq!(ai_score(&tests, Some(100.0), &npu), 100.0);
    }

    #[test]
    fn test_quantization_breadth_declared_precisions() {
        let declared = AcceleratorInfo {
            supports_int4: true,
            supports_int8: true,
            supports_fp16: true,
            ..AcceleratorInfo::none()
        };
        assert_eq!(quantization_breadth_from(&serde_json::Value::Null, &declared), 100.0);

        let slow = json!({ "fp32": 100.0, "int8": 10.0, "int4": 10.0 });
        assert_eq!(quantization_breadth_from(&slow, &AcceleratorInfo::none()), 0.0);

        let fast_int8 = json!({ "fp32": 100.0, "int8": 50.0, "int4": 10.0 });
        let breadth = quantization_breadth_from(&fast_int8, &AcceleratorInfo::none());
        assert!((breadth - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_full_run_caches_result() {
        let scratch = TempDir::new().unwrap();
        let facts = DeviceFacts {
            cpu_brand: "Apple M2".to_string(),
            total_memory_mb: 8000,
            cpu_cores: 8,
            ..Default::default()
        };
        let runner = quick_runner(Arc::new(StaticDeviceProbe::new(facts)), &scratch);
        assert_eq!(runner.status().await.unwrap(), BenchmarkStatus::NeverRun);

        let mut progress = Vec::new();
        let token = CancellationToken::new();
        let result = runner
            .run(|fraction, name| progress.push((fraction, name.to_string())), &token)
            .await
            .unwrap();

        assert_eq!(result.tests.len(), 10);
        assert_eq!(progress.len(), 10);
        assert_eq!(progress[0].1, "CPU Single-Core");
        assert_eq!(progress[9].0, 1.0);
        assert!(progress.windows(2).all(|p| p[0].0 < p[1].0));
        assert_eq!(result.accelerator.kind, AcceleratorKind::Npu);
        assert!((0.0..=100.0).contains(&result.ai_score));
        assert_eq!(
            result.tier,
            tier::classify(result.aggregate_score, 8000, 8)
        );
        assert!(!runner.is_running());

        let cached = runner.cached_result().await.unwrap().unwrap();
        assert_eq!(cached.tier, result.tier);
        assert_eq!(cached.tests.len(), 10);
        assert_eq!(cached.recommendations.len(), result.recommendations.len());

        runner.clear_cache().await.unwrap();
        assert_eq!(runner.status().await.unwrap(), BenchmarkStatus::NeverRun);
    }

    #[tokio::test]
    async fn test_cancelled_run_persists_nothing() {
        let scratch = TempDir::new().unwrap();
        let runner = quick_runner(Arc::new(StaticDeviceProbe::default()), &scratch);

        let token = CancellationToken::new();
        token.cancel();
        let err = runner.run(|_, _| {}, &token).await.unwrap_err();

        assert!(matches!(err, ManagerError::BenchmarkAbandoned));
        assert_eq!(runner.status().await.unwrap(), BenchmarkStatus::NeverRun);
        assert!(!runner.is_running());
    }

    struct BrokenProbe;

    #[async_trait]
    impl DeviceProbe for BrokenProbe {
        async fn facts(&self) -> anyhow::Result<DeviceFacts> {
            anyhow::bail!("sensor bus unavailable")
        }
    }

    #[tokio::test]
    async fn test_device_failure_cached_as_failed() {
        let scratch = TempDir::new().unwrap();
        let runner = quick_runner(Arc::new(BrokenProbe), &scratch);

        let token = CancellationToken::new();
        assert!(runner.run(|_, _| {}, &token).await.is_err());

        match runner.status().await.unwrap() {
            BenchmarkStatus::Failed { error, .. } => assert!(error.contains("sensor bus")),
            other => panic!("expected failed status, got {:?}", other),
        }
        assert!(runner.cached_result().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected() {
        let scratch = TempDir::new().unwrap();
        let mut runner = quick_runner(Arc::new(StaticDeviceProbe::default()), &scratch);
        runner.settings.thermal_window = Duration::from_secs(5);
        runner.settings.thermal_interval = Duration::from_secs(1);
        let runner = Arc::new(runner);

        let token = CancellationToken::new();
        let first = {
            let runner = runner.clone();
            let token = token.clone();
            tokio::spawn(async move { runner.run(|_, _| {}, &token).await })
        };

        while !runner.is_running() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let second = runner.run(|_, _| {}, &CancellationToken::new()).await;
        assert!(matches!(second, Err(ManagerError::BenchmarkInProgress)));

        token.cancel();
        let first = first.await.unwrap();
        assert!(matches!(first, Err(ManagerError::BenchmarkAbandoned)));
    }
}
