//! Model catalog descriptors and catalog clients
//!
//! Descriptors are immutable snapshots of a catalog entry. The lifecycle
//! manager copies them into transfer state and installed metadata but never
//! mutates them.

use crate::capability::PerformanceTier;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const MIB: u64 = 1024 * 1024;

/// Payload file name used when a descriptor lists no explicit files
pub const DEFAULT_PAYLOAD_FILE: &str = "model.gguf";

/// Category of a model, derived from its tags when not given
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModelCategory {
    #[default]
    WritingAssistant,
    CodeHelper,
    LanguageTranslation,
    ImageProcessing,
    VoiceProcessing,
    Specialized,
    Creative,
    Custom,
}

impl ModelCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WritingAssistant => "writing-assistant",
            Self::CodeHelper => "code-helper",
            Self::LanguageTranslation => "language-translation",
            Self::ImageProcessing => "image-processing",
            Self::VoiceProcessing => "voice-processing",
            Self::Specialized => "specialized",
            Self::Creative => "creative",
            Self::Custom => "custom",
        }
    }

    /// Map catalog tags to a category; the first matching rule wins
    pub fn from_tags<S: AsRef<str>>(tags: &[S]) -> Self {
        let tags: Vec<String> = tags.iter().map(|t| t.as_ref().to_lowercase()).collect();
        let has = |needles: &[&str]| tags.iter().any(|t| needles.contains(&t.as_str()));

        if has(&["text-generation", "language-model"]) {
            Self::WritingAssistant
        } else if has(&["code", "programming"]) {
            Self::CodeHelper
        } else if has(&["translation"]) {
            Self::LanguageTranslation
        } else if has(&["image", "vision"]) {
            Self::ImageProcessing
        } else if has(&["audio", "speech"]) {
            Self::VoiceProcessing
        } else if has(&["medical", "legal", "science"]) {
            Self::Specialized
        } else if has(&["creative", "story", "art"]) {
            Self::Creative
        } else {
            Self::WritingAssistant
        }
    }
}

impl fmt::Display for ModelCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let category = match s.to_ascii_lowercase().as_str() {
            "writing-assistant" => Self::WritingAssistant,
            "code-helper" => Self::CodeHelper,
            "language-translation" => Self::LanguageTranslation,
            "image-processing" => Self::ImageProcessing,
            "voice-processing" => Self::VoiceProcessing,
            "specialized" => Self::Specialized,
            "creative" => Self::Creative,
            "custom" => Self::Custom,
            other => return Err(format!("Unknown model category '{}'", other)),
        };
        Ok(category)
    }
}

/// Tier hint for an artifact of the given size
pub fn estimate_tier(size_mb: u64) -> PerformanceTier {
    if size_mb < 1000 {
        PerformanceTier::Low
    } else if size_mb < 4000 {
        PerformanceTier::Medium
    } else {
        PerformanceTier::High
    }
}

/// Runtime memory estimate: weights plus working set
pub fn estimate_memory_mb(size_mb: u64) -> u64 {
    (size_mb as f64 * 1.8).round() as u64
}

/// One payload file of an artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    pub name: String,
    pub url: String,
    pub size_bytes: u64,
    /// Hex SHA-256 digest; verified after download when present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Immutable catalog entry for a downloadable model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    /// Catalog id in `vendor/name` form
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub license: String,
    /// Declared size in MB
    pub size_mb: u64,
    pub memory_requirement_mb: u64,
    pub tier: PerformanceTier,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: ModelCategory,
    pub download_url: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<ArtifactFile>,
}

impl ArtifactDescriptor {
    /// Build a descriptor with catalog estimates for everything but id and size
    pub fn new(id: impl Into<String>, size_mb: u64) -> Self {
        let id = id.into();
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let author = id.split('/').next().unwrap_or_default().to_string();
        let download_url = format!(
            "https://huggingface.co/{}/resolve/main/{}",
            id, DEFAULT_PAYLOAD_FILE
        );

        Self {
            name,
            description: String::new(),
            author,
            license: String::new(),
            size_mb,
            memory_requirement_mb: estimate_memory_mb(size_mb),
            tier: estimate_tier(size_mb),
            tags: Vec::new(),
            category: ModelCategory::default(),
            download_url,
            files: Vec::new(),
            id,
        }
    }

    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = tags.into_iter().map(Into::into).collect();
        self.category = ModelCategory::from_tags(&self.tags);
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = url.into();
        self
    }

    pub fn with_files(mut self, files: Vec<ArtifactFile>) -> Self {
        self.files = files;
        self
    }

    /// Files that make up the payload
    ///
    /// An empty file list means a single [`DEFAULT_PAYLOAD_FILE`] at
    /// `download_url` with the declared size.
    pub fn payload_files(&self) -> Vec<ArtifactFile> {
        if !self.files.is_empty() {
            return self.files.clone();
        }
        vec![ArtifactFile {
            name: DEFAULT_PAYLOAD_FILE.to_string(),
            url: self.download_url.clone(),
            size_bytes: self.size_mb * MIB,
            sha256: None,
        }]
    }

    /// Total declared payload bytes
    pub fn declared_bytes(&self) -> u64 {
        self.payload_files().iter().map(|f| f.size_bytes).sum()
    }

    fn matches(&self, query: &str) -> bool {
        if query.is_empty() {
            return true;
        }
        let query = query.to_lowercase();
        self.id.to_lowercase().contains(&query)
            || self.name.to_lowercase().contains(&query)
            || self.description.to_lowercase().contains(&query)
            || self.tags.iter().any(|t| t.to_lowercase().contains(&query))
    }
}

/// Source of artifact descriptors
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn search(
        &self,
        query: &str,
        category: Option<ModelCategory>,
        limit: usize,
    ) -> Result<Vec<ArtifactDescriptor>>;

    async fn details(&self, id: &str) -> Result<Option<ArtifactDescriptor>>;
}

/// Catalog file entry; missing fields are filled from catalog estimates
#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    id: String,
    size_mb: u64,
    name: Option<String>,
    #[serde(default)]
    description: String,
    author: Option<String>,
    #[serde(default)]
    license: String,
    memory_requirement_mb: Option<u64>,
    tier: Option<PerformanceTier>,
    #[serde(default)]
    tags: Vec<String>,
    category: Option<ModelCategory>,
    download_url: Option<String>,
    #[serde(default)]
    files: Vec<ArtifactFile>,
}

impl From<CatalogEntry> for ArtifactDescriptor {
    fn from(entry: CatalogEntry) -> Self {
        let mut descriptor = ArtifactDescriptor::new(entry.id, entry.size_mb)
            .with_tags(entry.tags)
            .with_files(entry.files);

        descriptor.description = entry.description;
        descriptor.license = entry.license;
        if let Some(name) = entry.name {
            descriptor.name = name;
        }
        if let Some(author) = entry.author {
            descriptor.author = author;
        }
        if let Some(memory) = entry.memory_requirement_mb {
            descriptor.memory_requirement_mb = memory;
        }
        if let Some(tier) = entry.tier {
            descriptor.tier = tier;
        }
        if let Some(category) = entry.category {
            descriptor.category = category;
        }
        if let Some(url) = entry.download_url {
            descriptor.download_url = url;
        }
        descriptor
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    models: Vec<CatalogEntry>,
}

/// Catalog backed by a local TOML or JSON file
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    entries: Vec<ArtifactDescriptor>,
}

impl StaticCatalog {
    pub fn from_entries(entries: Vec<ArtifactDescriptor>) -> Self {
        Self { entries }
    }

    /// Load a catalog file with a top-level `models` list
    ///
    /// `.json` files are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read catalog file: {:?}", path))?;

        let file: CatalogFile = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content).context("Failed to parse JSON catalog")?
        } else {
            toml::from_str(&content).context("Failed to parse TOML catalog")?
        };

        let entries: Vec<ArtifactDescriptor> = file.models.into_iter().map(Into::into).collect();
        tracing::info!(path = ?path, models = entries.len(), "Loaded model catalog");

        Ok(Self { entries })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CatalogClient for StaticCatalog {
    async fn search(
        &self,
        query: &str,
        category: Option<ModelCategory>,
        limit: usize,
    ) -> Result<Vec<ArtifactDescriptor>> {
        Ok(self
            .entries
            .iter()
            .filter(|d| category.is_none_or(|c| d.category == c))
            .filter(|d| d.matches(query))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn details(&self, id: &str) -> Result<Option<ArtifactDescriptor>> {
        Ok(self.entries.iter().find(|d| d.id == id).cloned())
    }
}
