//! Heuristic accelerator detection from device identifiers

use crate::device::DeviceFacts;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorKind {
    Npu,
    Gpu,
    #[default]
    None,
}

impl AcceleratorKind {
    /// AI-capability bonus points for this accelerator class
    pub fn bonus(&self) -> f64 {
        match self {
            Self::Npu => 20.0,
            Self::Gpu => 10.0,
            Self::None => 0.0,
        }
    }
}

impl fmt::Display for AcceleratorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Npu => write!(f, "npu"),
            Self::Gpu => write!(f, "gpu"),
            Self::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceleratorInfo {
    pub kind: AcceleratorKind,
    pub vendor: String,
    pub name: String,
    /// Vendor-declared peak throughput; 0 when unknown
    pub tops: f64,
    pub supports_int4: bool,
    pub supports_int8: bool,
    pub supports_fp16: bool,
}

impl AcceleratorInfo {
    pub fn none() -> Self {
        Self::default()
    }

    /// Number of reduced precisions the accelerator declares
    pub fn precision_count(&self) -> usize {
        [self.supports_int4, self.supports_int8, self.supports_fp16]
            .iter()
            .filter(|s| **s)
            .count()
    }
}

struct Rule {
    needles: &'static [&'static str],
    build: fn(&str) -> AcceleratorInfo,
}

fn npu(vendor: &str, name: &str, tops: f64, int4: bool, fp16: bool) -> AcceleratorInfo {
    AcceleratorInfo {
        kind: AcceleratorKind::Npu,
        vendor: vendor.to_string(),
        name: name.to_string(),
        tops,
        supports_int4: int4,
        supports_int8: true,
        supports_fp16: fp16,
    }
}

fn apple(identifier: &str) -> AcceleratorInfo {
    let tops = if identifier.contains("m4") {
        38.0
    } else if identifier.contains("m3") {
        18.0
    } else if identifier.contains("m2") {
        15.8
    } else {
        11.0
    };
    npu("Apple", "Neural Engine", tops, true, true)
}

fn qualcomm(identifier: &str) -> AcceleratorInfo {
    let tops = if identifier.contains("8 gen 3") || identifier.contains("x elite") {
        45.0
    } else {
        15.0
    };
    npu("Qualcomm", "Hexagon NPU", tops, true, true)
}

fn nvidia(identifier: &str) -> AcceleratorInfo {
    AcceleratorInfo {
        kind: AcceleratorKind::Gpu,
        vendor: "NVIDIA".to_string(),
        name: identifier.to_string(),
        tops: 0.0,
        supports_int4: true,
        supports_int8: true,
        supports_fp16: true,
    }
}

fn amd_gpu(identifier: &str) -> AcceleratorInfo {
    AcceleratorInfo {
        kind: AcceleratorKind::Gpu,
        vendor: "AMD".to_string(),
        name: identifier.to_string(),
        tops: 0.0,
        supports_int4: false,
        supports_int8: true,
        supports_fp16: true,
    }
}

// Checked in order; NPUs before GPUs so SoCs with both report the NPU
const RULES: &[Rule] = &[
    Rule {
        needles: &["apple m", "apple a"],
        build: apple,
    },
    Rule {
        needles: &["snapdragon", "qualcomm"],
        build: qualcomm,
    },
    Rule {
        needles: &["google tensor"],
        build: |_| npu("Google", "Tensor TPU", 4.0, false, true),
    },
    Rule {
        needles: &["exynos"],
        build: |_| npu("Samsung", "Exynos NPU", 14.7, false, true),
    },
    Rule {
        needles: &["dimensity", "mediatek"],
        build: |_| npu("MediaTek", "APU", 10.0, true, true),
    },
    Rule {
        needles: &["core ultra"],
        build: |_| npu("Intel", "AI Boost NPU", 11.0, false, true),
    },
    Rule {
        needles: &["ryzen ai"],
        build: |_| npu("AMD", "Ryzen AI NPU", 16.0, false, true),
    },
    Rule {
        needles: &["nvidia", "geforce", "rtx", "quadro", "tesla"],
        build: nvidia,
    },
    Rule {
        needles: &["radeon"],
        build: amd_gpu,
    },
];

/// Detect an accelerator from identifiers; first matching rule wins
pub fn detect(facts: &DeviceFacts) -> AcceleratorInfo {
    let identifiers = facts.identifiers();

    for rule in RULES {
        if let Some(identifier) = identifiers
            .iter()
            .find(|id| rule.needles.iter().any(|needle| id.contains(needle)))
        {
            let info = (rule.build)(identifier);
            tracing::debug!(
                kind = %info.kind,
                vendor = %info.vendor,
                name = %info.name,
                "Detected accelerator"
            );
            return info;
        }
    }

    AcceleratorInfo::none()
}
