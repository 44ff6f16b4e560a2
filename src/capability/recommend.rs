//! Model recommendations from tier, AI score and accelerator

use super::accelerator::AcceleratorInfo;
use super::tier::PerformanceTier;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Candidates at or below this compatibility are dropped
pub const MIN_COMPATIBILITY: f64 = 30.0;
/// Heavy candidates need an AI score strictly above this
pub const HEAVY_AI_THRESHOLD: f64 = 70.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateClass {
    Light,
    Medium,
    Heavy,
}

impl CandidateClass {
    /// Compatibility penalty subtracted from the AI score
    pub fn penalty(&self) -> f64 {
        match self {
            Self::Light => 0.0,
            Self::Medium => 10.0,
            Self::Heavy => 25.0,
        }
    }

    fn battery_impact(&self) -> BatteryImpact {
        match self {
            Self::Light => BatteryImpact::Low,
            Self::Medium => BatteryImpact::Medium,
            Self::Heavy => BatteryImpact::High,
        }
    }

    fn eligible(&self, tier: PerformanceTier, ai_score: f64) -> bool {
        match self {
            Self::Light => true,
            Self::Medium => tier >= PerformanceTier::Medium,
            Self::Heavy => tier == PerformanceTier::High && ai_score > HEAVY_AI_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    Int4,
    Int8,
}

impl Quantization {
    pub fn bytes_per_parameter(&self) -> f64 {
        match self {
            Self::Int4 => 0.5,
            Self::Int8 => 1.0,
        }
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int4 => write!(f, "int4"),
            Self::Int8 => write!(f, "int8"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatteryImpact {
    Low,
    Medium,
    High,
}

/// Fixed catalog entry the engine chooses from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub model_id: String,
    /// Parameters in billions
    pub parameters_billions: f64,
    pub class: CandidateClass,
    /// Tokens per second on a device with AI score 100, at int8
    pub reference_tokens_per_sec: f64,
    pub use_cases: Vec<String>,
}

impl Candidate {
    fn new(
        model_id: &str,
        parameters_billions: f64,
        class: CandidateClass,
        reference_tokens_per_sec: f64,
        use_cases: &[&str],
    ) -> Self {
        Self {
            model_id: model_id.to_string(),
            parameters_billions,
            class,
            reference_tokens_per_sec,
            use_cases: use_cases.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub model_id: String,
    pub parameter_count: String,
    pub class: CandidateClass,
    pub quantization: Quantization,
    pub estimated_tokens_per_sec: f64,
    pub estimated_memory_mb: u64,
    pub battery_impact: BatteryImpact,
    /// 0-100
    pub compatibility: f64,
    pub use_cases: Vec<String>,
}

/// Ranks a fixed set of light, medium and heavy candidates for a device
#[derive(Debug, Clone)]
pub struct RecommendationEngine {
    candidates: Vec<Candidate>,
}

impl Default for RecommendationEngine {
    fn default() -> Self {
        use CandidateClass::*;
        Self::with_candidates(vec![
            Candidate::new(
                "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
                1.1,
                Light,
                40.0,
                &["chat", "writing"],
            ),
            Candidate::new(
                "Qwen/Qwen2.5-0.5B-Instruct",
                0.5,
                Light,
                60.0,
                &["chat", "translation"],
            ),
            Candidate::new(
                "microsoft/Phi-3-mini-4k-instruct",
                3.8,
                Medium,
                18.0,
                &["reasoning", "code"],
            ),
            Candidate::new(
                "google/gemma-2-2b-it",
                2.6,
                Medium,
                24.0,
                &["chat", "summarization"],
            ),
            Candidate::new(
                "mistralai/Mistral-7B-Instruct-v0.3",
                7.2,
                Heavy,
                9.0,
                &["writing", "reasoning"],
            ),
            Candidate::new(
                "meta-llama/Llama-3.1-8B-Instruct",
                8.0,
                Heavy,
                8.0,
                &["chat", "code", "reasoning"],
            ),
        ])
    }
}

impl RecommendationEngine {
    pub fn with_candidates(candidates: Vec<Candidate>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Eligible candidates with compatibility above the floor, best first
    pub fn recommend(
        &self,
        tier: PerformanceTier,
        ai_score: f64,
        accelerator: &AcceleratorInfo,
    ) -> Vec<ModelRecommendation> {
        let quantization = if accelerator.supports_int4 {
            Quantization::Int4
        } else {
            Quantization::Int8
        };
        let speedup = match quantization {
            Quantization::Int4 => 1.4,
            Quantization::Int8 => 1.0,
        };

        let mut recommendations: Vec<ModelRecommendation> = self
            .candidates
            .iter()
            .filter(|c| c.class.eligible(tier, ai_score))
            .filter_map(|c| {
                let compatibility = (ai_score - c.class.penalty()).clamp(0.0, 100.0);
                if compatibility <= MIN_COMPATIBILITY {
                    return None;
                }

                // Weights plus 20% for activations and KV cache
                let memory_mb =
                    c.parameters_billions * 1000.0 * quantization.bytes_per_parameter() * 1.2;

                Some(ModelRecommendation {
                    model_id: c.model_id.clone(),
                    parameter_count: format!("{}B", c.parameters_billions),
                    class: c.class,
                    quantization,
                    estimated_tokens_per_sec: (c.reference_tokens_per_sec
                        * (ai_score / 100.0)
                        * speedup
                        * 10.0)
                        .round()
                        / 10.0,
                    estimated_memory_mb: memory_mb.round() as u64,
                    battery_impact: c.class.battery_impact(),
                    compatibility,
                    use_cases: c.use_cases.clone(),
                })
            })
            .collect();

        recommendations.sort_by(|a, b| b.compatibility.total_cmp(&a.compatibility));
        recommendations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int4_accelerator() -> AcceleratorInfo {
        AcceleratorInfo {
            supports_int4: true,
            supports_int8: true,
            ..AcceleratorInfo::none()
        }
    }

    #[test]
    fn test_low_tier_only_light() {
        let engine = RecommendationEngine::default();
        let recs = engine.recommend(PerformanceTier::Low, 40.0, &AcceleratorInfo::none());

        assert_eq!(recs.len(), 2);
        assert!(recs.iter().all(|r| r.class == CandidateClass::Light));
        assert!(recs.iter().all(|r| r.compatibility > MIN_COMPATIBILITY));
    }

    #[test]
    fn test_heavy_requires_high_tier_and_score() {
        let engine = RecommendationEngine::default();

        let medium = engine.recommend(PerformanceTier::Medium, 95.0, &AcceleratorInfo::none());
        assert!(medium.iter().all(|r| r.class != CandidateClass::Heavy));
        assert!(medium.iter().any(|r| r.class == CandidateClass::Medium));

        let high_but_weak = engine.recommend(PerformanceTier::High, 70.0, &AcceleratorInfo::none());
        assert!(high_but_weak.iter().all(|r| r.class != CandidateClass::Heavy));

        let high = engine.recommend(PerformanceTier::High, 80.0, &AcceleratorInfo::none());
        assert!(high.iter().any(|r| r.class == CandidateClass::Heavy));
    }

    #[test]
    fn test_compatibility_floor() {
        let engine = RecommendationEngine::default();
        // light 30 is not above the floor
        assert!(
            engine
                .recommend(PerformanceTier::Low, 30.0, &AcceleratorInfo::none())
                .is_empty()
        );
        // medium 40 - 10 = 30 is dropped, light 40 kept
        let recs = engine.recommend(PerformanceTier::Medium, 40.0, &AcceleratorInfo::none());
        assert!(recs.iter().all(|r| r.class == CandidateClass::Light));
    }

    #[test]
    fn test_quantization_follows_accelerator() {
        let engine = RecommendationEngine::default();
        let int8 = engine.recommend(PerformanceTier::Low, 60.0, &AcceleratorInfo::none());
        assert!(int8.iter().all(|r| r.quantization == Quantization::Int8));

        let int4 = engine.recommend(PerformanceTier::Low, 60.0, &int4_accelerator());
        assert!(int4.iter().all(|r| r.quantization == Quantization::Int4));
        assert!(int4[0].estimated_memory_mb < int8[0].estimated_memory_mb);
    }

    #[test]
    fn test_sorted_by_compatibility() {
        let engine = RecommendationEngine::default();
        let recs = engine.recommend(PerformanceTier::High, 90.0, &int4_accelerator());
        assert_eq!(recs.len(), 6);
        assert!(
            recs.windows(2)
                .all(|pair| pair[0].compatibility >= pair[1].compatibility)
        );
        assert_eq!(recs[0].compatibility, 90.0);
        assert_eq!(recs[5].compatibility, 65.0);
        assert_eq!(recs[5].battery_impact, BatteryImpact::High);
    }
}
