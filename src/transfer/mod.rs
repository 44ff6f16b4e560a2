//! Artifact transfer lifecycle
//!
//! Provides:
//! - Transfer state records, progress snapshots and lifecycle events
//! - The fetch-with-progress capability and an HTTP implementation
//! - The download manager state machine

pub mod fetch;
pub mod manager;
pub mod state;

pub use fetch::{ChunkProgress, FetchOutcome, FetchRequest, Fetcher, HttpFetcher};
pub use manager::{DownloadManager, DownloadSettings};
pub use state::{
    FailureKind, TransferEvent, TransferFailure, TransferProgress, TransferState, TransferStatus,
};
