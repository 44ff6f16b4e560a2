//! Error types for lifecycle and capability operations

use crate::transfer::TransferStatus;
use thiserror::Error;

/// Errors surfaced by the public manager API
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Artifact '{id}' already has an active transfer")]
    AlreadyActive { id: String },

    #[error("No transfer found for artifact '{id}'")]
    NotFound { id: String },

    #[error("Artifact '{id}' is not installed")]
    NotInstalled { id: String },

    #[error("Artifact '{id}' maps to the storage directory already used by '{owner}'")]
    PathConflict { id: String, owner: String },

    #[error("Integrity check failed for artifact '{id}': {reason}")]
    IntegrityMismatch { id: String, reason: String },

    #[error("Transfer failed for artifact '{id}': {reason}")]
    TransportFailure { id: String, reason: String },

    #[error(
        "Insufficient storage: {required} bytes required, {available} bytes available"
    )]
    InsufficientStorage { required: u64, available: u64 },

    #[error("Cannot {action} artifact '{id}' while it is {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: TransferStatus,
    },

    #[error("A benchmark is already running")]
    BenchmarkInProgress,

    #[error("Benchmark abandoned before completion")]
    BenchmarkAbandoned,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ManagerError {
    /// Short machine-readable label, used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AlreadyActive { .. } => "already_active",
            Self::NotFound { .. } => "not_found",
            Self::NotInstalled { .. } => "not_installed",
            Self::PathConflict { .. } => "path_conflict",
            Self::IntegrityMismatch { .. } => "integrity_mismatch",
            Self::TransportFailure { .. } => "transport_failure",
            Self::InsufficientStorage { .. } => "insufficient_storage",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::BenchmarkInProgress => "benchmark_in_progress",
            Self::BenchmarkAbandoned => "benchmark_abandoned",
            Self::Config(_) => "config",
            Self::Storage(_) => "storage",
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_transition_message() {
        let err = ManagerError::InvalidTransition {
            id: "acme/tiny".to_string(),
            action: "resume",
            status: TransferStatus::Downloading,
        };
        assert_eq!(
            err.to_string(),
            "Cannot resume artifact 'acme/tiny' while it is downloading"
        );
        assert_eq!(err.kind(), "invalid_transition");
    }

    #[test]
    fn test_storage_from_anyhow() {
        let err: ManagerError = anyhow::anyhow!("disk on fire").into();
        assert_eq!(err.kind(), "storage");
        assert_eq!(err.to_string(), "disk on fire");
    }
}
