//! Property-based tests using proptest
//!
//! These tests verify invariants across randomized inputs, helping catch
//! edge cases that might be missed by example-based testing.

use offlaine_manager::capability::{
    AcceleratorInfo, CandidateClass, PerformanceTier, RecommendationEngine, classify,
    overall_score,
};
use offlaine_manager::catalog::{ArtifactDescriptor, ModelCategory, estimate_tier};
use offlaine_manager::config::ManagerConfig;
use offlaine_manager::ring::RingBuffer;
use proptest::prelude::*;

// =============================================================================
// Arbitrary Implementations
// =============================================================================

fn arb_tier() -> impl Strategy<Value = PerformanceTier> {
    prop_oneof![
        Just(PerformanceTier::Low),
        Just(PerformanceTier::Medium),
        Just(PerformanceTier::High),
    ]
}

fn arb_accelerator() -> impl Strategy<Value = AcceleratorInfo> {
    (any::<bool>(), any::<bool>(), any::<bool>()).prop_map(|(int4, int8, fp16)| AcceleratorInfo {
        supports_int4: int4,
        supports_int8: int8,
        supports_fp16: fp16,
        ..AcceleratorInfo::none()
    })
}

// =============================================================================
// Tier Classifier Invariants
// =============================================================================

proptest! {
    /// Identical inputs always yield the identical tier
    #[test]
    fn classify_is_deterministic(score in -100.0f64..5000.0, memory in 0u64..32000, cores in 0usize..64) {
        prop_assert_eq!(classify(score, memory, cores), classify(score, memory, cores));
    }

    /// The blended score stays within [0, 1]
    #[test]
    fn overall_score_bounded(score in -1e6f64..1e6, memory in 0u64..u64::MAX / 2, cores in 0usize..4096) {
        let overall = overall_score(score, memory, cores);
        prop_assert!((0.0..=1.0 + 1e-12).contains(&overall));
    }

    /// More of any input never lowers the tier
    #[test]
    fn classify_is_monotonic(
        score in 0.0f64..3000.0,
        memory in 0u64..12000,
        cores in 0usize..16,
        extra_score in 0.0f64..1000.0,
        extra_memory in 0u64..4000,
        extra_cores in 0usize..8,
    ) {
        let base = classify(score, memory, cores);
        let boosted = classify(score + extra_score, memory + extra_memory, cores + extra_cores);
        prop_assert!(boosted >= base);
    }

    /// Saturated inputs are always high tier
    #[test]
    fn saturated_device_is_high(score in 2000.0f64..1e6, memory in 8000u64..1_000_000, cores in 8usize..1024) {
        prop_assert_eq!(classify(score, memory, cores), PerformanceTier::High);
    }
}

// =============================================================================
// Recommendation Engine Invariants
// =============================================================================

proptest! {
    /// Heavy candidates never appear unless the device is high tier
    #[test]
    fn heavy_only_on_high_tier(tier in arb_tier(), ai in 0.0f64..100.0, acc in arb_accelerator()) {
        let recs = RecommendationEngine::default().recommend(tier, ai, &acc);
        if tier != PerformanceTier::High || ai <= 70.0 {
            prop_assert!(recs.iter().all(|r| r.class != CandidateClass::Heavy));
        }
        if tier == PerformanceTier::Low {
            prop_assert!(recs.iter().all(|r| r.class == CandidateClass::Light));
        }
    }

    /// Every recommendation clears the compatibility floor, sorted best first
    #[test]
    fn recommendations_above_floor_and_sorted(tier in arb_tier(), ai in 0.0f64..100.0, acc in arb_accelerator()) {
        let recs = RecommendationEngine::default().recommend(tier, ai, &acc);
        prop_assert!(recs.iter().all(|r| r.compatibility > 30.0 && r.compatibility <= 100.0));
        prop_assert!(recs.windows(2).all(|w| w[0].compatibility >= w[1].compatibility));
    }

    /// Quantization follows the accelerator's int4 support
    #[test]
    fn quantization_tracks_int4(ai in 31.0f64..100.0, acc in arb_accelerator()) {
        let recs = RecommendationEngine::default().recommend(PerformanceTier::Low, ai, &acc);
        let expected = if acc.supports_int4 { "int4" } else { "int8" };
        prop_assert!(recs.iter().all(|r| r.quantization.to_string() == expected));
    }
}

// =============================================================================
// Ring Buffer Invariants
// =============================================================================

proptest! {
    /// Length never exceeds capacity and the newest items are retained
    #[test]
    fn ring_keeps_newest(capacity in 1usize..64, items in prop::collection::vec(any::<u32>(), 0..256)) {
        let mut ring = RingBuffer::new(capacity);
        for item in &items {
            ring.push(*item);
            prop_assert!(ring.len() <= capacity);
        }

        let expected: Vec<u32> = items
            .iter()
            .skip(items.len().saturating_sub(capacity))
            .copied()
            .collect();
        prop_assert_eq!(ring.to_vec(), expected);
    }
}

// =============================================================================
// Catalog Estimates
// =============================================================================

proptest! {
    /// Descriptors built from a size agree with the size-based tier hint
    #[test]
    fn descriptor_estimates(size_mb in 0u64..100_000) {
        let descriptor = ArtifactDescriptor::new("acme/model", size_mb);
        prop_assert_eq!(descriptor.tier, estimate_tier(size_mb));
        prop_assert!(descriptor.memory_requirement_mb >= size_mb);
        prop_assert_eq!(descriptor.declared_bytes(), size_mb * 1024 * 1024);
    }

    /// Category parsing accepts its own display form
    #[test]
    fn category_display_parses(index in 0usize..8) {
        let categories = [
            "writing-assistant", "code-helper", "language-translation", "image-processing",
            "voice-processing", "specialized", "creative", "custom",
        ];
        let parsed: ModelCategory = categories[index].parse().unwrap();
        prop_assert_eq!(parsed.to_string(), categories[index]);
    }
}

// =============================================================================
// Config Serialization
// =============================================================================

proptest! {
    /// ManagerConfig serializes to TOML and deserializes back
    #[test]
    fn manager_config_roundtrip(
        max_concurrent in 1usize..16,
        staleness_days in 1i64..365,
        history_capacity in 1usize..10_000,
        window in 10u64..600,
    ) {
        let mut config = ManagerConfig {
            max_concurrent_downloads: max_concurrent,
            staleness_days,
            history_capacity,
            ..Default::default()
        };
        config.benchmark.thermal_window_secs = window;

        let toml_str = toml::to_string(&config).expect("Failed to serialize to TOML");
        let parsed: ManagerConfig = toml::from_str(&toml_str).expect("Failed to parse TOML");

        prop_assert_eq!(parsed.max_concurrent_downloads, max_concurrent);
        prop_assert_eq!(parsed.staleness_days, staleness_days);
        prop_assert_eq!(parsed.history_capacity, history_capacity);
        prop_assert_eq!(parsed.benchmark, config.benchmark);
        prop_assert_eq!(parsed.data_dir, config.data_dir);
    }
}
