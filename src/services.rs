//! Service wiring
//!
//! Every service is built once here from its collaborators and shared by
//! handle. Nothing is global.

use crate::analytics::{AnalyticsSettings, StorageAnalyticsEngine};
use crate::artifacts::{ArtifactFileStore, FileSystem, LocalFileSystem};
use crate::capability::{BenchmarkRunner, BenchmarkSettings, RecommendationEngine, WorkloadSizes};
use crate::catalog::{CatalogClient, StaticCatalog};
use crate::config::ManagerConfig;
use crate::device::{DeviceProbe, SystemDeviceProbe};
use crate::monitor::ResourceMonitor;
use crate::personalization::PersonalizationStore;
use crate::store::{FileKvStore, KeyValueStore, RecordStore};
use crate::transfer::{DownloadManager, DownloadSettings, Fetcher, HttpFetcher};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

/// Swappable edges of the system
pub struct Collaborators {
    pub kv: Arc<dyn KeyValueStore>,
    pub fs: Arc<dyn FileSystem>,
    pub fetcher: Arc<dyn Fetcher>,
    pub probe: Arc<dyn DeviceProbe>,
    pub catalog: Arc<dyn CatalogClient>,
}

#[derive(Clone)]
pub struct Services {
    pub config: ManagerConfig,
    pub records: RecordStore,
    pub downloads: DownloadManager,
    pub analytics: Arc<StorageAnalyticsEngine>,
    pub personalization: PersonalizationStore,
    pub catalog: Arc<dyn CatalogClient>,
    pub benchmarks: Arc<BenchmarkRunner>,
    pub monitor: Arc<ResourceMonitor>,
}

impl Services {
    /// Build production services and restore persisted transfers
    pub async fn from_config(config: ManagerConfig) -> Result<Self> {
        let kv = FileKvStore::open(config.records_dir()).await?;

        let catalog: Arc<dyn CatalogClient> = match &config.catalog_file {
            Some(path) => Arc::new(StaticCatalog::load(path)?),
            None => Arc::new(StaticCatalog::default()),
        };

        let collaborators = Collaborators {
            kv: Arc::new(kv),
            fs: Arc::new(LocalFileSystem::new()),
            fetcher: Arc::new(HttpFetcher::new(config.http_timeout())?),
            probe: Arc::new(SystemDeviceProbe::new(config.data_dir.clone())),
            catalog,
        };

        let services = Self::with_collaborators(config, collaborators);
        let restored = services
            .downloads
            .restore()
            .await
            .context("Failed to restore transfer states")?;
        tracing::info!(
            data_dir = ?services.config.data_dir,
            restored = restored.len(),
            "Services ready"
        );
        Ok(services)
    }

    /// Build services over the given collaborators without touching storage
    pub fn with_collaborators(config: ManagerConfig, collaborators: Collaborators) -> Self {
        let records = RecordStore::new(collaborators.kv);
        let files = ArtifactFileStore::new(collaborators.fs, config.models_dir());

        let analytics = Arc::new(StorageAnalyticsEngine::new(
            records.clone(),
            files.clone(),
            AnalyticsSettings {
                staleness: chrono::Duration::days(config.staleness_days),
                compression_savings_bytes: config.compression_savings_mb * 1024 * 1024,
            },
        ));

        let downloads = DownloadManager::new(
            records.clone(),
            files,
            collaborators.fetcher,
            analytics.clone(),
            DownloadSettings {
                max_concurrent: config.max_concurrent_downloads,
                integrity_tolerance: config.integrity_tolerance,
            },
        );

        let benchmarks = Arc::new(BenchmarkRunner::new(
            records.clone(),
            collaborators.probe,
            RecommendationEngine::default(),
            BenchmarkSettings {
                thermal_window: Duration::from_secs(config.benchmark.thermal_window_secs),
                thermal_interval: Duration::from_secs(config.benchmark.thermal_interval_secs),
                scratch_dir: config.scratch_dir(),
                sizes: WorkloadSizes::default(),
            },
        ));

        Self {
            personalization: downloads.personalization().clone(),
            monitor: Arc::new(ResourceMonitor::new(config.history_capacity)),
            catalog: collaborators.catalog,
            records,
            downloads,
            analytics,
            benchmarks,
            config,
        }
    }
}
