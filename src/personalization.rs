//! Per-artifact user metadata

use crate::store::{PERSONALIZATION_PREFIX, RecordStore, personalization_key};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonalizationRecord {
    pub model_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
    #[serde(default)]
    pub favorited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default)]
    pub custom_settings: BTreeMap<String, serde_json::Value>,
    /// 1 to 5
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rating: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_notes: Option<String>,
}

impl PersonalizationRecord {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            custom_name: None,
            favorited: false,
            last_used: None,
            usage_count: 0,
            custom_settings: BTreeMap::new(),
            user_rating: None,
            user_notes: None,
        }
    }
}

/// Partial update; `None` fields are left untouched, settings are merged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersonalizationUpdate {
    pub custom_name: Option<String>,
    pub favorited: Option<bool>,
    pub custom_settings: Option<BTreeMap<String, serde_json::Value>>,
    pub user_rating: Option<u8>,
    pub user_notes: Option<String>,
}

/// Personalization records, created lazily on first mutation
///
/// Clones share one write lock, so read-modify-write updates never lose
/// each other's changes.
#[derive(Clone)]
pub struct PersonalizationStore {
    records: RecordStore,
    writes: Arc<Mutex<()>>,
}

impl PersonalizationStore {
    pub fn new(records: RecordStore) -> Self {
        Self {
            records,
            writes: Arc::new(Mutex::new(())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<PersonalizationRecord>> {
        self.records.get(&personalization_key(id)).await
    }

    pub async fn update(
        &self,
        id: &str,
        update: PersonalizationUpdate,
    ) -> Result<PersonalizationRecord> {
        if let Some(rating) = update.user_rating
            && !(1..=5).contains(&rating)
        {
            anyhow::bail!("User rating must be between 1 and 5 (got {})", rating);
        }

        let _write = self.writes.lock().await;
        let mut record = self.load_or_new(id).await?;
        if let Some(name) = update.custom_name {
            record.custom_name = Some(name);
        }
        if let Some(favorited) = update.favorited {
            record.favorited = favorited;
        }
        if let Some(settings) = update.custom_settings {
            record.custom_settings.extend(settings);
        }
        if let Some(rating) = update.user_rating {
            record.user_rating = Some(rating);
        }
        if let Some(notes) = update.user_notes {
            record.user_notes = Some(notes);
        }

        self.save(&record).await?;
        Ok(record)
    }

    /// Flip the favorite flag, returning the new value
    pub async fn toggle_favorite(&self, id: &str) -> Result<bool> {
        let _write = self.writes.lock().await;
        let mut record = self.load_or_new(id).await?;
        record.favorited = !record.favorited;
        self.save(&record).await?;

        tracing::debug!(model_id = %id, favorited = record.favorited, "Toggled favorite");
        Ok(record.favorited)
    }

    /// Bump the usage counter and last-used timestamp
    pub async fn record_usage(&self, id: &str) -> Result<PersonalizationRecord> {
        let _write = self.writes.lock().await;
        let mut record = self.load_or_new(id).await?;
        record.usage_count += 1;
        record.last_used = Some(Utc::now());
        self.save(&record).await?;
        Ok(record)
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let _write = self.writes.lock().await;
        self.records.delete(&personalization_key(id)).await
    }

    /// Ids of favorited artifacts, sorted
    pub async fn favorites(&self) -> Result<Vec<String>> {
        let mut favorites = Vec::new();
        for key in self.records.keys(PERSONALIZATION_PREFIX).await? {
            if let Some(record) = self.records.get::<PersonalizationRecord>(&key).await?
                && record.favorited
            {
                favorites.push(record.model_id);
            }
        }
        favorites.sort();
        Ok(favorites)
    }

    async fn load_or_new(&self, id: &str) -> Result<PersonalizationRecord> {
        Ok(self
            .get(id)
            .await?
            .unwrap_or_else(|| PersonalizationRecord::new(id)))
    }

    async fn save(&self, record: &PersonalizationRecord) -> Result<()> {
        self.records
            .set(&personalization_key(&record.model_id), record)
            .await
    }
}
