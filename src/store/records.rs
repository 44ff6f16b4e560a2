//! Typed record access over a key-value backend

use super::kv::KeyValueStore;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Key prefix for per-artifact transfer state
pub const DOWNLOAD_STATE_PREFIX: &str = "download_state:";
/// Key prefix for per-artifact personalization
pub const PERSONALIZATION_PREFIX: &str = "model_personalization:";
/// Key for the storage analytics snapshot
pub const STORAGE_ANALYTICS_KEY: &str = "storage_analytics";
/// Key for the cached benchmark outcome
pub const BENCHMARK_CACHE_KEY: &str = "device_benchmark_cache";

pub fn download_state_key(id: &str) -> String {
    format!("{DOWNLOAD_STATE_PREFIX}{id}")
}

pub fn personalization_key(id: &str) -> String {
    format!("{PERSONALIZATION_PREFIX}{id}")
}

/// Typed get/set/delete over a [`KeyValueStore`]
///
/// Pure relay: owns no records and applies no merge semantics. Every `set`
/// replaces the stored value wholesale.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn KeyValueStore>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self { backend }
    }

    /// Load and deserialize a record
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let Some(raw) = self.backend.get(key).await? else {
            return Ok(None);
        };

        let value = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse record '{}'", key))?;
        Ok(Some(value))
    }

    /// Serialize and store a record
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)
            .with_context(|| format!("Failed to serialize record '{}'", key))?;
        self.backend.set(key, &raw).await
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key).await
    }

    /// List record keys under a prefix
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.backend.keys(prefix).await
    }
}
