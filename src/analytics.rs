//! Storage accounting and optimization over installed artifacts

use crate::artifacts::ArtifactFileStore;
use crate::error::ManagerResult;
use crate::metrics;
use crate::store::{RecordStore, STORAGE_ANALYTICS_KEY};
use crate::transfer::DownloadManager;
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::Mutex;

/// Aggregate disk usage, replaced wholesale on every recompute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageAnalytics {
    pub total_models: usize,
    /// Sum of declared sizes
    pub total_size_mb: u64,
    pub bytes_on_disk: u64,
    pub available_space_bytes: u64,
    pub compressed_models: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cleanup: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub computed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct AnalyticsSettings {
    /// Artifacts installed longer ago than this are flagged for compression
    pub staleness: Duration,
    /// Estimated bytes saved per compressed artifact
    pub compression_savings_bytes: u64,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::days(30),
            compression_savings_bytes: 50 * 1024 * 1024,
        }
    }
}

/// Result of one optimization run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub actions: Vec<String>,
    pub duplicates_removed: usize,
    pub compressed: usize,
    /// Bytes actually freed (duplicates and scratch files)
    pub reclaimed_bytes: u64,
    /// Estimated savings from compression flags
    pub estimated_savings_bytes: u64,
}

impl OptimizationReport {
    pub fn total_savings_bytes(&self) -> u64 {
        self.reclaimed_bytes + self.estimated_savings_bytes
    }
}

pub struct StorageAnalyticsEngine {
    records: RecordStore,
    files: ArtifactFileStore,
    settings: AnalyticsSettings,
    /// Serializes read-compute-persist so a stale result never lands last
    refresh_lock: Mutex<()>,
}

impl StorageAnalyticsEngine {
    pub fn new(
        records: RecordStore,
        files: ArtifactFileStore,
        settings: AnalyticsSettings,
    ) -> Self {
        Self {
            records,
            files,
            settings,
            refresh_lock: Mutex::new(()),
        }
    }

    /// Recompute and persist usage; failures yield a default snapshot
    pub async fn recompute(&self) -> StorageAnalytics {
        let _guard = self.refresh_lock.lock().await;
        let last_cleanup = self.snapshot().await.last_cleanup;
        match self.refresh(last_cleanup).await {
            Ok(analytics) => analytics,
            Err(e) => {
                tracing::warn!(error = %e, "Storage analytics unavailable, using defaults");
                StorageAnalytics::default()
            }
        }
    }

    /// Last persisted analytics, or defaults
    pub async fn snapshot(&self) -> StorageAnalytics {
        match self.records.get(STORAGE_ANALYTICS_KEY).await {
            Ok(Some(analytics)) => analytics,
            Ok(None) => StorageAnalytics::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load storage analytics");
                StorageAnalytics::default()
            }
        }
    }

    async fn refresh(&self, last_cleanup: Option<DateTime<Utc>>) -> Result<StorageAnalytics> {
        let installed = self.files.list_installed().await?;
        let available_space_bytes = self.files.free_space().await?;

        let mut bytes_on_disk = 0;
        for artifact in &installed {
            bytes_on_disk += self.files.path_size(&artifact.local_path).await?;
        }

        let analytics = StorageAnalytics {
            total_models: installed.len(),
            total_size_mb: installed.iter().map(|a| a.descriptor.size_mb).sum(),
            bytes_on_disk,
            available_space_bytes,
            compressed_models: installed.iter().filter(|a| a.compressed).count(),
            last_cleanup,
            computed_at: Some(Utc::now()),
        };

        self.records.set(STORAGE_ANALYTICS_KEY, &analytics).await?;
        metrics::update_installed_artifacts(analytics.total_models);
        tracing::debug!(
            models = analytics.total_models,
            bytes_on_disk = analytics.bytes_on_disk,
            "Storage analytics recomputed"
        );

        Ok(analytics)
    }

    /// Run duplicate removal, staleness marking and scratch cleanup
    ///
    /// Each pass is idempotent: a second run with no new installs reports
    /// zero savings.
    pub async fn optimize(&self, manager: &DownloadManager) -> ManagerResult<OptimizationReport> {
        let mut report = OptimizationReport::default();

        self.remove_duplicates(manager, &mut report).await?;
        self.mark_stale(&mut report).await?;
        self.clean_temp(&mut report).await?;

        let analytics = {
            let _guard = self.refresh_lock.lock().await;
            self.refresh(Some(Utc::now())).await?
        };
        tracing::info!(
            actions = report.actions.len(),
            reclaimed_bytes = report.reclaimed_bytes,
            estimated_savings_bytes = report.estimated_savings_bytes,
            models = analytics.total_models,
            "Storage optimization finished"
        );

        Ok(report)
    }

    async fn remove_duplicates(
        &self,
        manager: &DownloadManager,
        report: &mut OptimizationReport,
    ) -> ManagerResult<()> {
        // Oldest install of each (name, size) group is kept
        let installed = self.files.list_installed().await?;
        let mut seen = HashSet::new();

        for artifact in installed {
            let key = (artifact.descriptor.name.clone(), artifact.descriptor.size_mb);
            if seen.insert(key) {
                continue;
            }

            let id = artifact.id();
            match manager.delete(id).await {
                Ok(bytes) => {
                    report.duplicates_removed += 1;
                    report.reclaimed_bytes += bytes;
                    report.actions.push(format!("Removed duplicate model {}", id));
                }
                Err(e) => {
                    tracing::warn!(model_id = %id, error = %e, "Failed to remove duplicate");
                }
            }
        }
        Ok(())
    }

    async fn mark_stale(&self, report: &mut OptimizationReport) -> ManagerResult<()> {
        let cutoff = Utc::now() - self.settings.staleness;

        for mut artifact in self.files.list_installed().await? {
            if artifact.compressed || artifact.installed_at >= cutoff {
                continue;
            }

            artifact.compressed = true;
            artifact.compressed_at = Some(Utc::now());
            self.files.write_metadata(&artifact).await?;

            report.compressed += 1;
            report.estimated_savings_bytes += self.settings.compression_savings_bytes;
            report
                .actions
                .push(format!("Compressed unused model {}", artifact.id()));
        }
        Ok(())
    }

    async fn clean_temp(&self, report: &mut OptimizationReport) -> ManagerResult<()> {
        let temp = self.files.temp_dir();
        if !self.files.fs().exists(&temp).await {
            return Ok(());
        }

        let size = self.files.path_size(&temp).await?;
        self.files.fs().remove(&temp).await?;

        report.reclaimed_bytes += size;
        report
            .actions
            .push(format!("Cleared temporary files ({} bytes)", size));
        metrics::record_bytes_reclaimed(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::{FileSystem, FsEntry, FsMetadata, InstalledArtifact, LocalFileSystem};
    use crate::catalog::ArtifactDescriptor;
    use crate::store::MemoryKvStore;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    /// Filesystem whose listing and space queries always fail
    struct BrokenFs;

    #[async_trait]
    impl FileSystem for BrokenFs {
        async fn exists(&self, _path: &Path) -> bool {
            true
        }

        async fn create_dir_all(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>> {
            anyhow::bail!("I/O error listing {:?}", path)
        }

        async fn stat(&self, path: &Path) -> Result<FsMetadata> {
            anyhow::bail!("I/O error reading {:?}", path)
        }

        async fn remove(&self, _path: &Path) -> Result<()> {
            Ok(())
        }

        async fn write_file(&self, _path: &Path, _contents: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
            anyhow::bail!("I/O error reading {:?}", path)
        }

        async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
            Ok(())
        }

        async fn free_space(&self, _path: &Path) -> Result<u64> {
            anyhow::bail!("statvfs failed")
        }
    }

    fn engine(dir: &TempDir) -> StorageAnalyticsEngine {
        let records = RecordStore::new(Arc::new(MemoryKvStore::new()));
        let files =
            ArtifactFileStore::new(Arc::new(LocalFileSystem::new()), dir.path().join("models"));
        StorageAnalyticsEngine::new(records, files, AnalyticsSettings::default())
    }

    async fn install(engine: &StorageAnalyticsEngine, id: &str, size_mb: u64, age_days: i64) {
        let dir = engine.files.prepare(id).await.unwrap();
        std::fs::write(dir.join("model.gguf"), vec![0u8; 64]).unwrap();
        engine
            .files
            .write_metadata(&InstalledArtifact {
                descriptor: ArtifactDescriptor::new(id, size_mb),
                installed_at: Utc::now() - Duration::days(age_days),
                local_path: dir,
                size_on_disk_bytes: 64,
                compressed: false,
                compressed_at: None,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recompute_counts_installed() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        install(&engine, "acme/a", 10, 0).await;
        install(&engine, "acme/b", 20, 0).await;

        let analytics = engine.recompute().await;
        assert_eq!(analytics.total_models, 2);
        assert_eq!(analytics.total_size_mb, 30);
        assert!(analytics.bytes_on_disk >= 128);
        assert!(analytics.available_space_bytes > 0);

        assert_eq!(engine.snapshot().await, analytics);
    }

    #[tokio::test]
    async fn test_recompute_empty_library() {
        let dir = TempDir::new().unwrap();
        let analytics = engine(&dir).recompute().await;
        assert_eq!(analytics.total_models, 0);
        assert_eq!(analytics.total_size_mb, 0);
    }

    #[tokio::test]
    async fn test_recompute_falls_back_to_defaults_on_fs_errors() {
        let kv = Arc::new(MemoryKvStore::new());
        let files = ArtifactFileStore::new(Arc::new(BrokenFs), "/models");
        let engine = StorageAnalyticsEngine::new(
            RecordStore::new(kv.clone()),
            files,
            AnalyticsSettings::default(),
        );

        assert_eq!(engine.recompute().await, StorageAnalytics::default());
        // Nothing persisted, and later calls keep working
        assert!(kv.is_empty().await);
        assert_eq!(engine.recompute().await, StorageAnalytics::default());
        assert_eq!(engine.snapshot().await, StorageAnalytics::default());
    }

    #[tokio::test]
    async fn test_concurrent_recompute_keeps_last_cleanup() {
        let dir = TempDir::new().unwrap();
        let engine = Arc::new(engine(&dir));
        install(&engine, "acme/a", 10, 0).await;

        let cleaned = Utc::now() - Duration::hours(1);
        engine
            .records
            .set(
                STORAGE_ANALYTICS_KEY,
                &StorageAnalytics {
                    last_cleanup: Some(cleaned),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let runs: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.recompute().await })
            })
            .collect();
        for run in runs {
            let analytics = run.await.unwrap();
            assert_eq!(analytics.total_models, 1);
            assert_eq!(analytics.last_cleanup, Some(cleaned));
        }
        assert_eq!(engine.snapshot().await.last_cleanup, Some(cleaned));
    }

    #[tokio::test]
    async fn test_snapshot_defaults_before_first_recompute() {
        let dir = TempDir::new().unwrap();
        assert_eq!(engine(&dir).snapshot().await, StorageAnalytics::default());
    }

    #[tokio::test]
    async fn test_stale_marking_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        install(&engine, "acme/old", 10, 45).await;
        install(&engine, "acme/new", 10, 1).await;

        let mut first = OptimizationReport::default();
        engine.mark_stale(&mut first).await.unwrap();
        assert_eq!(first.compressed, 1);
        assert_eq!(first.estimated_savings_bytes, 50 * 1024 * 1024);

        let old = engine.files.read_metadata("acme/old").await.unwrap().unwrap();
        assert!(old.compressed);
        assert!(old.compressed_at.is_some());

        let mut second = OptimizationReport::default();
        engine.mark_stale(&mut second).await.unwrap();
        assert_eq!(second.total_savings_bytes(), 0);
    }

    #[tokio::test]
    async fn test_clean_temp() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir);
        let temp = engine.files.temp_dir();
        std::fs::create_dir_all(&temp).unwrap();
        std::fs::write(temp.join("scratch.bin"), vec![0u8; 300]).unwrap();

        let mut report = OptimizationReport::default();
        engine.clean_temp(&mut report).await.unwrap();
        assert_eq!(report.reclaimed_bytes, 300);
        assert!(!temp.exists());

        let mut again = OptimizationReport::default();
        engine.clean_temp(&mut again).await.unwrap();
        assert_eq!(again.reclaimed_bytes, 0);
        assert!(again.actions.is_empty());
    }
}
