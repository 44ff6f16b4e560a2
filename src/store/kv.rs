//! Key-value persistence backends for small JSON records

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

// ============================================================================
// Trait Definitions
// ============================================================================

/// Trait for key-value storage operations
///
/// Values are opaque strings (JSON in practice). Implementations must make
/// `set` atomic: a reader sees either the old or the new value, never a mix.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Load the value for a key
    /// Returns None if the key doesn't exist
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous one
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List keys starting with `prefix`, sorted
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

// ============================================================================
// Production Implementation
// ============================================================================

/// File-backed store: one JSON file per key inside a directory
///
/// Keys are URL-encoded to form file names, so ids containing `/` or `:`
/// map to a single flat file. Every write goes through its own temp file,
/// so concurrent writers of one key race only on the final rename.
pub struct FileKvStore {
    dir: PathBuf,
    writes: AtomicU64,
}

impl FileKvStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create store directory: {:?}", dir))?;
        Ok(Self {
            dir,
            writes: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", urlencoding::encode(key)))
    }

    fn temp_path_for(&self, key: &str) -> PathBuf {
        let seq = self.writes.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!(
            "{}.{}.{}.tmp",
            urlencoding::encode(key),
            std::process::id(),
            seq
        ))
    }
}

#[async_trait]
impl KeyValueStore for FileKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let path = self.path_for(key);
        match fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read record: {:?}", path)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        // Atomic write: write to temp file, then rename
        let path = self.path_for(key);
        let temp_file = self.temp_path_for(key);

        let written = async {
            let mut file = fs::File::create(&temp_file)
                .await
                .context("Failed to create temp record file")?;
            file.write_all(value.as_bytes())
                .await
                .context("Failed to write record file")?;
            file.sync_all().await.context("Failed to sync record file")?;

            fs::rename(&temp_file, &path)
                .await
                .context("Failed to rename temp record file")
        }
        .await;

        if written.is_err() {
            let _ = fs::remove_file(&temp_file).await;
        }
        written
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete record: {:?}", path)),
        }
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list store directory: {:?}", self.dir))?;

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(encoded) = name.strip_suffix(".json") else {
                continue;
            };
            let Ok(key) = urlencoding::decode(encoded) else {
                tracing::warn!(file = %name, "Skipping record with undecodable name");
                continue;
            };
            if key.starts_with(prefix) {
                keys.push(key.into_owned());
            }
        }

        keys.sort();
        Ok(keys)
    }
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// Volatile store, used by tests and dry runs
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl KeyValueStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
