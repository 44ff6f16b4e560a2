//! Directory-per-artifact layout on top of a [`FileSystem`]

use super::fs::FileSystem;
use crate::catalog::ArtifactDescriptor;
use crate::error::{ManagerError, ManagerResult};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const METADATA_FILE: &str = "metadata.json";
pub const PARTIAL_SUFFIX: &str = ".part";
/// Scratch directory under the models root, removed by optimization
pub const TEMP_DIR: &str = ".temp";

/// Metadata written next to an installed payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub descriptor: ArtifactDescriptor,
    pub installed_at: DateTime<Utc>,
    pub local_path: PathBuf,
    /// Payload bytes on disk at install time
    pub size_on_disk_bytes: u64,
    #[serde(default)]
    pub compressed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressed_at: Option<DateTime<Utc>>,
}

impl InstalledArtifact {
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`
pub fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Path of the in-progress download for a payload file
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Artifact directories under a models root
#[derive(Clone)]
pub struct ArtifactFileStore {
    fs: Arc<dyn FileSystem>,
    models_dir: PathBuf,
}

impl ArtifactFileStore {
    pub fn new(fs: Arc<dyn FileSystem>, models_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            models_dir: models_dir.into(),
        }
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.models_dir.join(TEMP_DIR)
    }

    pub fn dir_for(&self, id: &str) -> PathBuf {
        self.models_dir.join(sanitize_id(id))
    }

    pub async fn prepare(&self, id: &str) -> Result<PathBuf> {
        let dir = self.dir_for(id);
        self.fs.create_dir_all(&dir).await?;
        Ok(dir)
    }

    pub async fn free_space(&self) -> Result<u64> {
        self.fs.free_space(&self.models_dir).await
    }

    /// Write `metadata.json` atomically (temp file + rename)
    pub async fn write_metadata(&self, installed: &InstalledArtifact) -> Result<()> {
        let dir = self.dir_for(installed.id());
        let path = dir.join(METADATA_FILE);
        let temp_path = dir.join(format!("{}.tmp", METADATA_FILE));

        let json = serde_json::to_vec_pretty(installed).context("Failed to serialize metadata")?;
        self.fs.write_file(&temp_path, &json).await?;
        self.fs.rename(&temp_path, &path).await?;

        tracing::debug!(model_id = %installed.id(), path = ?path, "Wrote artifact metadata");
        Ok(())
    }

    /// Metadata for `id`; `None` when the directory is absent or belongs to
    /// another id with the same sanitized name
    pub async fn read_metadata(&self, id: &str) -> Result<Option<InstalledArtifact>> {
        Ok(self
            .read_metadata_at(&self.dir_for(id))
            .await?
            .filter(|installed| installed.id() == id))
    }

    /// Id of a different artifact already installed in `id`'s directory
    pub async fn foreign_owner(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .read_metadata_at(&self.dir_for(id))
            .await?
            .map(|installed| installed.descriptor.id)
            .filter(|owner| owner != id))
    }

    async fn read_metadata_at(&self, dir: &Path) -> Result<Option<InstalledArtifact>> {
        let path = dir.join(METADATA_FILE);
        if !self.fs.exists(&path).await {
            return Ok(None);
        }
        let bytes = self.fs.read_file(&path).await?;
        let installed = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse metadata: {:?}", path))?;
        Ok(Some(installed))
    }

    /// Every artifact with readable metadata, ordered by install time
    pub async fn list_installed(&self) -> Result<Vec<InstalledArtifact>> {
        if !self.fs.exists(&self.models_dir).await {
            return Ok(Vec::new());
        }

        let mut installed = Vec::new();
        for entry in self.fs.read_dir(&self.models_dir).await? {
            if !entry.is_dir || entry.name.starts_with('.') {
                continue;
            }
            match self.read_metadata_at(&entry.path).await {
                Ok(Some(artifact)) => installed.push(artifact),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        dir = %entry.name,
                        error = %e,
                        "Skipping unreadable artifact metadata"
                    );
                }
            }
        }

        installed.sort_by_key(|a| a.installed_at);
        Ok(installed)
    }

    /// Delete an artifact directory, returning the bytes it occupied
    pub async fn remove_artifact(&self, id: &str) -> Result<u64> {
        let dir = self.dir_for(id);
        let size = self.path_size(&dir).await?;
        self.fs.remove(&dir).await?;
        Ok(size)
    }

    /// Size of a file, or the recursive size of a directory; 0 if absent
    pub async fn path_size(&self, path: &Path) -> Result<u64> {
        if !self.fs.exists(path).await {
            return Ok(0);
        }

        let mut total = 0;
        let mut pending = vec![path.to_path_buf()];
        while let Some(current) = pending.pop() {
            let meta = self.fs.stat(&current).await?;
            if !meta.is_dir {
                total += meta.len;
                continue;
            }
            for entry in self.fs.read_dir(&current).await? {
                pending.push(entry.path);
            }
        }
        Ok(total)
    }

    /// Check that every payload file exists and matches its declared size
    ///
    /// Size must be within `tolerance` (a fraction) of the declared size.
    /// Files that declare a SHA-256 digest are hashed as well.
    pub async fn verify_payload(
        &self,
        descriptor: &ArtifactDescriptor,
        tolerance: f64,
    ) -> ManagerResult<()> {
        let dir = self.dir_for(&descriptor.id);
        let mismatch = |reason: String| ManagerError::IntegrityMismatch {
            id: descriptor.id.clone(),
            reason,
        };

        for file in descriptor.payload_files() {
            let path = dir.join(&file.name);
            if !self.fs.exists(&path).await {
                return Err(mismatch(format!("missing payload file '{}'", file.name)));
            }

            let actual = self.fs.stat(&path).await?.len;
            let declared = file.size_bytes;
            let deviation = (actual as f64 - declared as f64).abs();
            if deviation > declared as f64 * tolerance {
                return Err(mismatch(format!(
                    "'{}' is {} bytes, declared {} bytes (tolerance {:.0}%)",
                    file.name,
                    actual,
                    declared,
                    tolerance * 100.0
                )));
            }

            if let Some(expected) = &file.sha256 {
                let actual_digest = self.fs.sha256(&path).await?;
                if !actual_digest.eq_ignore_ascii_case(expected) {
                    return Err(mismatch(format!(
                        "'{}' has sha256 {}, expected {}",
                        file.name, actual_digest, expected
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LocalFileSystem;
    use crate::catalog::ArtifactFile;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> ArtifactFileStore {
        ArtifactFileStore::new(Arc::new(LocalFileSystem::new()), dir.path().join("models"))
    }

    fn descriptor(size_bytes: u64, sha256: Option<&str>) -> ArtifactDescriptor {
        ArtifactDescriptor::new("acme/tiny", 1).with_files(vec![ArtifactFile {
            name: "model.gguf".to_string(),
            url: "http://localhost/model.gguf".to_string(),
            size_bytes,
            sha256: sha256.map(str::to_string),
        }])
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("TheBloke/Llama-2_7B.gguf"), "TheBloke_Llama-2_7B_gguf");
        assert_eq!(sanitize_id("a b:c"), "a_b_c");
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/m/x/model.gguf")),
            PathBuf::from("/m/x/model.gguf.part")
        );
    }

    #[tokio::test]
    async fn test_metadata_roundtrip_and_listing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let local_path = store.prepare("acme/tiny").await.unwrap();

        let installed = InstalledArtifact {
            descriptor: ArtifactDescriptor::new("acme/tiny", 1),
            installed_at: Utc::now(),
            local_path,
            size_on_disk_bytes: 10,
            compressed: false,
            compressed_at: None,
        };
        store.write_metadata(&installed).await.unwrap();

        let loaded = store.read_metadata("acme/tiny").await.unwrap().unwrap();
        assert_eq!(loaded, installed);

        // Scratch and half-created directories are ignored
        store.fs().create_dir_all(&store.temp_dir()).await.unwrap();
        store.prepare("acme/partial").await.unwrap();

        let listed = store.list_installed().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), "acme/tiny");
    }

    #[tokio::test]
    async fn test_metadata_of_colliding_id_is_not_shared() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let local_path = store.prepare("acme/tiny_v1").await.unwrap();
        store
            .write_metadata(&InstalledArtifact {
                descriptor: ArtifactDescriptor::new("acme/tiny_v1", 1),
                installed_at: Utc::now(),
                local_path,
                size_on_disk_bytes: 10,
                compressed: false,
                compressed_at: None,
            })
            .await
            .unwrap();

        assert_eq!(store.dir_for("acme/tiny.v1"), store.dir_for("acme/tiny_v1"));
        assert!(store.read_metadata("acme/tiny.v1").await.unwrap().is_none());
        assert_eq!(
            store.foreign_owner("acme/tiny.v1").await.unwrap().as_deref(),
            Some("acme/tiny_v1")
        );
        assert!(store.foreign_owner("acme/tiny_v1").await.unwrap().is_none());
        assert!(store.foreign_owner("acme/other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_installed_without_root() {
        let dir = TempDir::new().unwrap();
        assert!(store(&dir).list_installed().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_artifact_reports_size() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let artifact_dir = store.prepare("acme/tiny").await.unwrap();
        std::fs::write(artifact_dir.join("model.gguf"), vec![0u8; 1500]).unwrap();
        std::fs::write(artifact_dir.join("config.json"), vec![0u8; 500]).unwrap();

        assert_eq!(store.remove_artifact("acme/tiny").await.unwrap(), 2000);
        assert!(!artifact_dir.exists());
        assert_eq!(store.remove_artifact("acme/tiny").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_verify_within_tolerance() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let artifact_dir = store.prepare("acme/tiny").await.unwrap();
        std::fs::write(artifact_dir.join("model.gguf"), vec![0u8; 1050]).unwrap();

        store.verify_payload(&descriptor(1000, None), 0.10).await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let artifact_dir = store.prepare("acme/tiny").await.unwrap();
        std::fs::write(artifact_dir.join("model.gguf"), vec![0u8; 1200]).unwrap();

        let err = store
            .verify_payload(&descriptor(1000, None), 0.10)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "integrity_mismatch");
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        store.prepare("acme/tiny").await.unwrap();

        let err = store
            .verify_payload(&descriptor(1000, None), 0.10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing payload file"));
    }

    #[tokio::test]
    async fn test_verify_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let artifact_dir = store.prepare("acme/tiny").await.unwrap();
        std::fs::write(artifact_dir.join("model.gguf"), b"hello").unwrap();

        let good = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
        store.verify_payload(&descriptor(5, Some(good)), 0.10).await.unwrap();

        let err = store
            .verify_payload(&descriptor(5, Some("deadbeef")), 0.10)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }
}
