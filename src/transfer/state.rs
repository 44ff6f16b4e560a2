//! Transfer state records and lifecycle events

use crate::catalog::ArtifactDescriptor;
use crate::error::ManagerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Status of an artifact transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    /// Accepted, not yet streaming
    Pending,
    /// Streaming (or waiting for a transfer slot)
    Downloading,
    /// Stopped by the user, resumable
    Paused,
    /// Verified and installed
    Completed,
    /// Transport or verification error; payload removed
    Failed,
    /// Transient signal only, never persisted
    Cancelled,
}

impl TransferStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Downloading => write!(f, "downloading"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Transport,
    Integrity,
}

/// Error detail kept on a failed transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&ManagerError> for TransferFailure {
    fn from(err: &ManagerError) -> Self {
        let kind = match err {
            ManagerError::IntegrityMismatch { .. } => FailureKind::Integrity,
            _ => FailureKind::Transport,
        };
        Self {
            kind,
            message: err.to_string(),
        }
    }
}

/// Persisted per-artifact transfer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    pub id: String,
    pub descriptor: ArtifactDescriptor,
    pub status: TransferStatus,
    /// Percent complete, 0-100; never decreases for the life of the record
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// Install directory, set once completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TransferFailure>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TransferState {
    pub fn new(descriptor: ArtifactDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: descriptor.id.clone(),
            total_bytes: descriptor.declared_bytes(),
            descriptor,
            status: TransferStatus::Pending,
            progress: 0.0,
            bytes_transferred: 0,
            local_path: None,
            last_error: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn set_status(&mut self, status: TransferStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Record bytes received so far; returns true if the progress fraction advanced
    ///
    /// Progress is a high-water mark: a transfer restarted from zero keeps
    /// reporting the furthest point it reached.
    pub fn record_progress(&mut self, bytes: u64) -> bool {
        self.bytes_transferred = bytes;
        self.updated_at = Utc::now();

        let percent = if self.total_bytes == 0 {
            0.0
        } else {
            (bytes as f64 / self.total_bytes as f64 * 100.0).min(100.0)
        };

        if percent > self.progress {
            self.progress = percent;
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self, bytes_per_sec: f64) -> TransferProgress {
        let remaining = self.total_bytes.saturating_sub(self.bytes_transferred);
        let eta_secs = (bytes_per_sec > 0.0 && self.status == TransferStatus::Downloading)
            .then(|| remaining as f64 / bytes_per_sec);

        TransferProgress {
            id: self.id.clone(),
            status: self.status,
            progress: self.progress,
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.total_bytes,
            bytes_per_sec,
            eta_secs,
            last_error: self.last_error.clone(),
        }
    }
}

/// Read-only view of a transfer handed to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub id: String,
    pub status: TransferStatus,
    pub progress: f64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub bytes_per_sec: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<TransferFailure>,
}

/// Lifecycle events broadcast to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferEvent {
    Progress(TransferProgress),
    StatusChanged { id: String, status: TransferStatus },
    /// A partial file was discarded because the source cannot serve ranges
    Restarted { id: String, file: String },
    Cancelled { id: String },
    Removed { id: String },
}

impl TransferEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Progress(p) => &p.id,
            Self::StatusChanged { id, .. }
            | Self::Restarted { id, .. }
            | Self::Cancelled { id }
            | Self::Removed { id } => id,
        }
    }
}
