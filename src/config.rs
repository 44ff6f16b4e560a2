//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Largest accepted in-memory sample history
pub const MAX_HISTORY_CAPACITY: usize = 100_000;

/// Longest accepted thermal benchmark window (one hour)
pub const MAX_THERMAL_WINDOW_SECS: u64 = 3600;

/// Main manager configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Root for records, artifacts and scratch space
    pub data_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    /// Allowed relative deviation between declared and actual payload size
    pub integrity_tolerance: f64,
    pub staleness_days: i64,
    pub compression_savings_mb: u64,
    pub http_timeout_secs: u64,
    /// Optional TOML/JSON catalog of artifact descriptors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog_file: Option<PathBuf>,
    /// Resource samples kept in memory
    pub history_capacity: usize,
    pub benchmark: BenchmarkConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent_downloads: 2,
            integrity_tolerance: 0.10,
            staleness_days: 30,
            compression_savings_mb: 50,
            http_timeout_secs: 30,
            catalog_file: None,
            history_capacity: 1000,
            benchmark: BenchmarkConfig::default(),
        }
    }
}

/// Benchmark timing and scratch location
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BenchmarkConfig {
    pub thermal_window_secs: u64,
    pub thermal_interval_secs: u64,
    /// Defaults to `<data_dir>/.benchmark` when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scratch_dir: Option<PathBuf>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            thermal_window_secs: 180,
            thermal_interval_secs: 10,
            scratch_dir: None,
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(data_dir) = std::env::var("OFFLAINE_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Ok(max) = std::env::var("OFFLAINE_MAX_CONCURRENT_DOWNLOADS") {
            config.max_concurrent_downloads = max
                .parse()
                .context("Invalid OFFLAINE_MAX_CONCURRENT_DOWNLOADS value")?;
        }
        if let Ok(catalog) = std::env::var("OFFLAINE_CATALOG_FILE") {
            config.catalog_file = Some(PathBuf::from(catalog));
        }

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_downloads == 0 {
            anyhow::bail!("max_concurrent_downloads must be at least 1");
        }
        if !(0.0..1.0).contains(&self.integrity_tolerance) {
            anyhow::bail!(
                "integrity_tolerance must be in [0, 1) (got {})",
                self.integrity_tolerance
            );
        }
        if self.staleness_days < 1 {
            anyhow::bail!("staleness_days must be at least 1 (got {})", self.staleness_days);
        }
        if !(1..=MAX_HISTORY_CAPACITY).contains(&self.history_capacity) {
            anyhow::bail!(
                "history_capacity must be between 1 and {} (got {})",
                MAX_HISTORY_CAPACITY,
                self.history_capacity
            );
        }
        if self.benchmark.thermal_interval_secs == 0 {
            anyhow::bail!("benchmark.thermal_interval_secs must be at least 1");
        }
        if self.benchmark.thermal_window_secs < self.benchmark.thermal_interval_secs {
            anyhow::bail!(
                "benchmark.thermal_window_secs ({}) must not be shorter than the interval ({})",
                self.benchmark.thermal_window_secs,
                self.benchmark.thermal_interval_secs
            );
        }
        if self.benchmark.thermal_window_secs > MAX_THERMAL_WINDOW_SECS {
            anyhow::bail!(
                "benchmark.thermal_window_secs must be at most {} (got {})",
                MAX_THERMAL_WINDOW_SECS,
                self.benchmark.thermal_window_secs
            );
        }
        if let Some(catalog) = &self.catalog_file
            && !catalog.exists()
        {
            anyhow::bail!("Catalog file does not exist: {:?}", catalog);
        }

        // Ensure the data directory exists or can be created
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Cannot create data directory: {:?}", self.data_dir))?;
        }

        Ok(())
    }

    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("records")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.benchmark
            .scratch_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join(".benchmark"))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("offlaine")
}
