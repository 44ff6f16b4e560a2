//! Performance tier classification

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference maxima used to normalize raw inputs
pub const REFERENCE_SCORE: f64 = 2000.0;
pub const REFERENCE_MEMORY_MB: f64 = 8000.0;
pub const REFERENCE_CORES: f64 = 8.0;

const SCORE_WEIGHT: f64 = 0.6;
const MEMORY_WEIGHT: f64 = 0.3;
const CORES_WEIGHT: f64 = 0.1;

const HIGH_THRESHOLD: f64 = 0.7;
const MEDIUM_THRESHOLD: f64 = 0.4;
/// Thresholds are inclusive; sums landing a rounding error below still count
const THRESHOLD_EPSILON: f64 = 1e-9;

/// Device performance classification, ordered low < medium < high
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceTier {
    #[default]
    Low,
    Medium,
    High,
}

impl PerformanceTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Human-readable summary of what the tier can handle
    pub fn description(&self) -> &'static str {
        match self {
            Self::Low => "Basic device suitable for small models and simple tasks",
            Self::Medium => "Mid-range device capable of running medium-sized models efficiently",
            Self::High => "High-performance device that can handle large models and complex tasks",
        }
    }

    /// Model size guidance for devices in this tier
    pub fn size_guidance(&self) -> SizeGuidance {
        match self {
            Self::Low => SizeGuidance {
                max_model_size_mb: 500,
                recommended_model_size_mb: 250,
            },
            Self::Medium => SizeGuidance {
                max_model_size_mb: 2000,
                recommended_model_size_mb: 1000,
            },
            Self::High => SizeGuidance {
                max_model_size_mb: 8000,
                recommended_model_size_mb: 4000,
            },
        }
    }
}

impl fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PerformanceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(format!("Unknown performance tier '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeGuidance {
    pub max_model_size_mb: u64,
    pub recommended_model_size_mb: u64,
}

/// Weighted blend of normalized score, memory and core count, in [0, 1]
pub fn overall_score(score: f64, memory_mb: u64, cores: usize) -> f64 {
    let normalized_score = normalize(score, REFERENCE_SCORE);
    let normalized_memory = normalize(memory_mb as f64, REFERENCE_MEMORY_MB);
    let normalized_cores = normalize(cores as f64, REFERENCE_CORES);

    normalized_score * SCORE_WEIGHT
        + normalized_memory * MEMORY_WEIGHT
        + normalized_cores * CORES_WEIGHT
}

/// Classify a device. Pure: identical inputs always give the identical tier.
pub fn classify(score: f64, memory_mb: u64, cores: usize) -> PerformanceTier {
    tier_for_overall(overall_score(score, memory_mb, cores))
}

pub fn tier_for_overall(overall: f64) -> PerformanceTier {
    if overall >= HIGH_THRESHOLD - THRESHOLD_EPSILON {
        PerformanceTier::High
    } else if overall >= MEDIUM_THRESHOLD - THRESHOLD_EPSILON {
        PerformanceTier::Medium
    } else {
        PerformanceTier::Low
    }
}

fn normalize(raw: f64, reference: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        return 0.0;
    }
    (raw / reference).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_saturated_device_is_high() {
        // score above the reference normalizes to 1.0
        assert_eq!(overall_score(2200.0, 8000, 8), 1.0);
        assert_eq!(classify(2200.0, 8000, 8), PerformanceTier::High);
    }

    #[test]
    fn test_high_boundary_inclusive() {
        // 0.5*0.6 + 1.0*0.3 + 1.0*0.1 = 0.7
        assert_eq!(classify(1000.0, 8000, 8), PerformanceTier::High);
    }

    #[test]
    fn test_medium_boundary_inclusive() {
        // 0*0.6 + 1.0*0.3 + 1.0*0.1 = 0.4
        assert_eq!(classify(0.0, 8000, 8), PerformanceTier::Medium);
        assert_eq!(tier_for_overall(0.4), PerformanceTier::Medium);
        assert_eq!(tier_for_overall(0.399), PerformanceTier::Low);
    }

    #[test]
    fn test_weak_device_is_low() {
        assert_eq!(classify(200.0, 2000, 2), PerformanceTier::Low);
    }

    #[test]
    fn test_negative_and_nan_inputs_clamp_to_zero() {
        assert_eq!(overall_score(-50.0, 0, 0), 0.0);
        assert_eq!(overall_score(f64::NAN, 0, 0), 0.0);
    }

    #[test]
    fn test_tier_ordering() {
        assert!(PerformanceTier::Low < PerformanceTier::Medium);
        assert!(PerformanceTier::Medium < PerformanceTier::High);
    }

    #[test]
    fn test_tier_parse_and_display() {
        assert_eq!("HIGH".parse::<PerformanceTier>().unwrap(), PerformanceTier::High);
        assert_eq!(PerformanceTier::Medium.to_string(), "medium");
        assert!("ultra".parse::<PerformanceTier>().is_err());
    }

    #[test]
    fn test_size_guidance() {
        let guidance = PerformanceTier::Medium.size_guidance();
        assert_eq!(guidance.max_model_size_mb, 2000);
        assert_eq!(guidance.recommended_model_size_mb, 1000);
    }
}
