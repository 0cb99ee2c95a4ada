//! Document persistence.
//!
//! The authority only talks to storage through the [`Disk`] trait:
//! - `load` when an instance is created
//! - `update` as a debounced hint after every accepted push
//! - `flush` as a forced write when an instance shuts down
//!
//! Documents are stored in their schema-encoded string form, so storage
//! stays independent of the document type.

mod memory;
mod sled_store;

pub use memory::MemoryDisk;
pub use sled_store::{DocumentStore, StorageError, StorageResult};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// A document as written to disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Schema-encoded document
    pub doc: String,
    /// Authority version at the time of the snapshot
    pub version: u64,
}

/// Lazily produces the current snapshot of a live document.
///
/// Returns `None` once the document is gone or cannot be encoded.
pub type SnapshotFn = Arc<dyn Fn() -> Option<Snapshot> + Send + Sync>;

/// Persistence collaborator used by the manager
#[async_trait]
pub trait Disk: Send + Sync + 'static {
    /// Load the encoded document, or `None` if it does not exist
    async fn load(&self, doc_name: &str) -> StorageResult<Option<String>>;

    /// Hint that the document changed. Implementations may coalesce bursts
    /// and call `snapshot` later.
    fn update(&self, doc_name: &str, snapshot: SnapshotFn);

    /// Write `snapshot` now, superseding any pending update.
    async fn flush(&self, doc_name: &str, snapshot: Snapshot) -> StorageResult<()>;
}

/// Metadata stored alongside document snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Document name
    pub doc_name: String,
    /// Unix timestamp of creation
    pub created_at: i64,
    /// Unix timestamp of last write
    pub updated_at: i64,
    /// Authority version at the last write
    pub version: u64,
    /// Size of the encoded document in bytes
    pub size_bytes: u64,
}

impl DocumentMetadata {
    pub fn new(doc_name: impl Into<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            doc_name: doc_name.into(),
            created_at: now,
            updated_at: now,
            version: 0,
            size_bytes: 0,
        }
    }
}

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Cache size in bytes (default: 64MB)
    pub cache_size: u64,
    /// Flush interval in milliseconds (0 = only on explicit flush)
    pub flush_interval_ms: u64,
    /// Delay used to coalesce `update` hints
    pub save_debounce: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/collab.sled".to_string(),
            cache_size: 64 * 1024 * 1024,
            flush_interval_ms: 500,
            save_debounce: Duration::from_secs(1),
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_cache_size(mut self, size: u64) -> Self {
        self.cache_size = size;
        self
    }

    pub fn with_save_debounce(mut self, delay: Duration) -> Self {
        self.save_debounce = delay;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_creation() {
        let meta = DocumentMetadata::new("notes");

        assert_eq!(meta.doc_name, "notes");
        assert_eq!(meta.version, 0);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.updated_at);
    }

    #[test]
    fn test_storage_config_default() {
        let config = StorageConfig::default();
        assert_eq!(config.cache_size, 64 * 1024 * 1024);
        assert_eq!(config.save_debounce, Duration::from_secs(1));

        let config = StorageConfig::new("/tmp/x").with_save_debounce(Duration::from_millis(10));
        assert_eq!(config.path, "/tmp/x");
        assert_eq!(config.save_debounce, Duration::from_millis(10));
    }
}
