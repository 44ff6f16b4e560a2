//! Device capability grading
//!
//! Provides:
//! - Synthetic benchmark workloads and the runner that scores them
//! - Accelerator detection from device identifiers
//! - Performance tier classification
//! - Model recommendations for a graded device

pub mod accelerator;
pub mod recommend;
pub mod runner;
pub mod tier;
pub mod workloads;

pub use accelerator::{AcceleratorInfo, AcceleratorKind, detect};
pub use recommend::{
    BatteryImpact, Candidate, CandidateClass, ModelRecommendation, Quantization,
    RecommendationEngine,
};
pub use runner::{BenchmarkResult, BenchmarkRunner, BenchmarkSettings, BenchmarkStatus};
pub use tier::{PerformanceTier, SizeGuidance, classify, overall_score};
pub use workloads::{BenchmarkTestKind, TestOutcome, WorkloadSizes};
