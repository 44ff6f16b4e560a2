//! Offlaine Manager - offline AI model manager
//!
//! Acquires model artifacts over resumable transfers, keeps the installed
//! library and its analytics consistent, and grades the host device to
//! recommend models it can actually run.

pub mod analytics;
pub mod artifacts;
pub mod capability;
pub mod catalog;
pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod monitor;
pub mod personalization;
pub mod ring;
pub mod services;
pub mod store;
pub mod transfer;

pub use analytics::{OptimizationReport, StorageAnalytics, StorageAnalyticsEngine};
pub use artifacts::{ArtifactFileStore, InstalledArtifact};
pub use capability::{BenchmarkResult, BenchmarkRunner, PerformanceTier, RecommendationEngine};
pub use catalog::{ArtifactDescriptor, CatalogClient, ModelCategory, StaticCatalog};
pub use config::ManagerConfig;
pub use error::{ManagerError, ManagerResult};
pub use monitor::ResourceMonitor;
pub use personalization::{PersonalizationRecord, PersonalizationStore};
pub use services::{Collaborators, Services};
pub use transfer::{DownloadManager, TransferEvent, TransferProgress, TransferStatus};
