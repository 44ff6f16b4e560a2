//! Filesystem collaborator for bulk artifact storage

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncReadExt;

/// Entry returned by [`FileSystem::read_dir`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsEntry {
    pub name: String,
    pub path: PathBuf,
    pub is_dir: bool,
}

/// Metadata returned by [`FileSystem::stat`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsMetadata {
    pub len: u64,
    pub is_dir: bool,
    pub modified: Option<DateTime<Utc>>,
}

/// Hierarchical file store holding artifact payloads
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>>;

    async fn stat(&self, path: &Path) -> Result<FsMetadata>;

    /// Remove a file or a directory tree. Missing paths are not an error.
    async fn remove(&self, path: &Path) -> Result<()>;

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>>;

    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Bytes available to unprivileged writers on the volume holding `path`
    async fn free_space(&self, path: &Path) -> Result<u64>;

    /// Hex SHA-256 of a file
    async fn sha256(&self, path: &Path) -> Result<String> {
        let contents = self.read_file(path).await?;
        Ok(hex_digest(Sha256::digest(&contents).as_slice()))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// [`FileSystem`] backed by the local disk
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem;

impl LocalFileSystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }

    async fn read_dir(&self, path: &Path) -> Result<Vec<FsEntry>> {
        let mut entries = fs::read_dir(path)
            .await
            .with_context(|| format!("Failed to read directory: {:?}", path))?;

        let mut result = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            result.push(FsEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                path: entry.path(),
                is_dir,
            });
        }
        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn stat(&self, path: &Path) -> Result<FsMetadata> {
        let meta = fs::metadata(path)
            .await
            .with_context(|| format!("Failed to stat: {:?}", path))?;
        Ok(FsMetadata {
            len: meta.len(),
            is_dir: meta.is_dir(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let meta = match fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).with_context(|| format!("Failed to stat: {:?}", path)),
        };

        let result = if meta.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove: {:?}", path)),
        }
    }

    async fn write_file(&self, path: &Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents)
            .await
            .with_context(|| format!("Failed to write file: {:?}", path))
    }

    async fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path)
            .await
            .with_context(|| format!("Failed to read file: {:?}", path))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)
            .await
            .with_context(|| format!("Failed to rename {:?} to {:?}", from, to))
    }

    async fn free_space(&self, path: &Path) -> Result<u64> {
        // The target directory may not exist yet; ask the nearest ancestor
        let mut probe = path.to_path_buf();
        while !self.exists(&probe).await {
            if !probe.pop() {
                anyhow::bail!("No existing ancestor for {:?}", path);
            }
        }
        available_bytes(&probe)
    }

    async fn sha256(&self, path: &Path) -> Result<String> {
        let mut file = fs::File::open(path)
            .await
            .with_context(|| format!("Failed to open for hashing: {:?}", path))?;

        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex_digest(hasher.finalize().as_slice()))
    }
}

#[cfg(unix)]
fn available_bytes(path: &Path) -> Result<u64> {
    let stats = nix::sys::statvfs::statvfs(path)
        .with_context(|| format!("Failed to check disk space for {:?}", path))?;
    Ok(stats.blocks_available() as u64 * stats.fragment_size() as u64)
}

#[cfg(not(unix))]
fn available_bytes(path: &Path) -> Result<u64> {
    use sysinfo::Disks;

    // Pick the disk with the longest mount point that prefixes the path
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
        .with_context(|| format!("No disk found for {:?}", path))
}
