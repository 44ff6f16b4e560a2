//! Shared fakes for integration tests

#![allow(dead_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use offlaine_manager::artifacts::{FileSystem, FsEntry, FsMetadata, LocalFileSystem};
use offlaine_manager::catalog::{ArtifactDescriptor, ArtifactFile, StaticCatalog};
use offlaine_manager::config::ManagerConfig;
use offlaine_manager::device::StaticDeviceProbe;
use offlaine_manager::store::MemoryKvStore;
use offlaine_manager::transfer::{ChunkProgress, FetchOutcome, FetchRequest, Fetcher};
use offlaine_manager::{Collaborators, Services};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const MIB: u64 = 1024 * 1024;

/// Fetcher serving sparse files of a configured length per URL
///
/// Files are grown with `set_len`, so large declared sizes cost nothing.
pub struct FakeFetcher {
    range: bool,
    chunks: u64,
    delay: Duration,
    served: Mutex<HashMap<String, u64>>,
    /// URL -> byte count after which the connection drops
    failures: Mutex<HashMap<String, u64>>,
    requests: Mutex<Vec<FetchRequest>>,
}

impl FakeFetcher {
    pub fn new(range: bool) -> Self {
        Self {
            range,
            chunks: 10,
            delay: Duration::from_millis(5),
            served: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Slow every chunk down so tests can act mid-transfer
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn serve(&self, url: &str, bytes: u64) {
        self.served.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn fail_after(&self, url: &str, bytes: u64) {
        self.failures.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Fetcher for FakeFetcher {
    fn supports_range(&self) -> bool {
        self.range
    }

    async fn fetch(
        &self,
        request: FetchRequest,
        progress: mpsc::UnboundedSender<ChunkProgress>,
        stop: CancellationToken,
    ) -> Result<FetchOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        let total = *self
            .served
            .lock()
            .unwrap()
            .get(&request.url)
            .with_context(|| format!("404 for {}", request.url))?;
        let fail_at = self.failures.lock().unwrap().get(&request.url).copied();

        let resume = request.offset > 0 && self.range;
        let restarted = request.offset > 0 && !self.range;
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!resume)
            .open(&request.dest)
            .await?;

        let mut written = if resume { request.offset } else { 0 };
        let chunk = (total / self.chunks).max(1);

        while written < total {
            tokio::select! {
                _ = stop.cancelled() => {
                    return Ok(FetchOutcome { bytes: written, stopped: true, restarted });
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
            if let Some(limit) = fail_at
                && written >= limit
            {
                anyhow::bail!("connection reset by peer");
            }

            written = (written + chunk).min(total);
            file.set_len(written).await?;
            let _ = progress.send(ChunkProgress {
                bytes_so_far: written,
                total_bytes: Some(total),
            });
        }

        Ok(FetchOutcome {
            bytes: written,
            stopped: false,
            restarted,
        })
    }
}

/// Local filesystem reporting a fixed amount of free space
pub struct FixedSpaceFs {
    inner: LocalFileSystem,
    free: u64,
}

impl FixedSpaceFs {
    pub fn new(free: u64) -> Self {
        Self {
            inner: LocalFileSystem::new(),
            free,
        }
    }
}

#[async_trait]
impl FileSystem for FixedSpaceFs {
    async fn exists(&self, path: &Path) -> bool {
        self.inner.exists(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        self.inner.create_dir_all(path).await
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>> {
        self.inner.read_dir(path).await
    }

    async fn stat(&self, path: &Path) -> Result<FsMetadata> {
        self.inner.stat(path).await
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.inner.remove(path).await
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        self.inner.write_file(path, contents).await
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        self.inner.read_file(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to).await
    }

    async fn free_space(&self, _path: &Path) -> Result<u64> {
        Ok(self.free)
    }
}

/// Services over fakes rooted in a temp dir
pub struct Harness {
    pub services: Services,
    pub fetcher: Arc<FakeFetcher>,
    pub kv: Arc<MemoryKvStore>,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(fetcher: FakeFetcher) -> Self {
        Self::with_fs(fetcher, Arc::new(FixedSpaceFs::new(u64::MAX / 2)))
    }

    pub fn with_fs(fetcher: FakeFetcher, fs: Arc<dyn FileSystem>) -> Self {
        let dir = TempDir::new().unwrap();
        let fetcher = Arc::new(fetcher);
        let kv = Arc::new(MemoryKvStore::new());
        Self::build(dir, fetcher, kv, fs)
    }

    /// Fresh services over the same storage, as after a process restart
    pub fn restart(self) -> Self {
        let fs: Arc<dyn FileSystem> = Arc::new(FixedSpaceFs::new(u64::MAX / 2));
        Self::build(self.dir, self.fetcher, self.kv, fs)
    }

    fn build(
        dir: TempDir,
        fetcher: Arc<FakeFetcher>,
        kv: Arc<MemoryKvStore>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        let config = ManagerConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let services = Services::with_collaborators(
            config,
            Collaborators {
                kv: kv.clone(),
                fs,
                fetcher: fetcher.clone(),
                probe: Arc::new(StaticDeviceProbe::default()),
                catalog: Arc::new(StaticCatalog::default()),
            },
        );

        Self {
            services,
            fetcher,
            kv,
            dir,
        }
    }

    pub fn models_dir(&self) -> std::path::PathBuf {
        self.services.config.models_dir()
    }
}

/// Single-file descriptor whose URL is served at its declared size
pub fn descriptor(fetcher: &FakeFetcher, id: &str, size_mb: u64) -> ArtifactDescriptor {
    let url = format!("https://models.test/{}/model.gguf", id);
    fetcher.serve(&url, size_mb * MIB);
    ArtifactDescriptor::new(id, size_mb).with_download_url(url)
}

/// Descriptor with two small files, served at their declared sizes
pub fn two_file_descriptor(fetcher: &FakeFetcher, id: &str) -> ArtifactDescriptor {
    let files = ["weights.bin", "tokenizer.json"]
        .iter()
        .zip([64 * 1024u64, 16 * 1024])
        .map(|(name, size)| {
            let url = format!("https://models.test/{}/{}", id, name);
            fetcher.serve(&url, size);
            ArtifactFile {
                name: name.to_string(),
                url,
                size_bytes: size,
                sha256: None,
            }
        })
        .collect();
    ArtifactDescriptor::new(id, 1).with_files(files)
}

/// Total bytes under a directory; 0 when it does not exist
pub fn dir_bytes(path: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                dir_bytes(&path)
            } else {
                entry.metadata().map(|m| m.len()).unwrap_or(0)
            }
        })
        .sum()
}
