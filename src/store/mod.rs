//! Persistence for small records
//!
//! Provides:
//! - A key-value backend trait with file and in-memory implementations
//! - A typed record layer used by every service for state durability

pub mod kv;
pub mod records;

pub use kv::{FileKvStore, KeyValueStore, MemoryKvStore};
pub use records::{
    BENCHMARK_CACHE_KEY, DOWNLOAD_STATE_PREFIX, PERSONALIZATION_PREFIX, RecordStore,
    STORAGE_ANALYTICS_KEY, download_state_key, personalization_key,
};
