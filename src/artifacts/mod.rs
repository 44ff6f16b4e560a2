//! Artifact payload storage
//!
//! Provides:
//! - A filesystem collaborator trait with a local-disk implementation
//! - The directory-per-artifact layout, metadata and integrity checks

pub mod fs;
pub mod store;

pub use fs::{FileSystem, FsEntry, FsMetadata, LocalFileSystem};
pub use store::{
    ArtifactFileStore, InstalledArtifact, METADATA_FILE, PARTIAL_SUFFIX, TEMP_DIR, partial_path,
    sanitize_id,
};
