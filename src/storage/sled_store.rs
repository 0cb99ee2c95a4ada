//! Sled-based storage implementation for collaborative documents.
//!
//! This module provides persistent storage for encoded document snapshots
//! using the Sled embedded database. It supports:
//! - Document creation, loading and deletion
//! - Metadata management
//! - Debounced snapshot writes driven by the authority

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use super::{Disk, DocumentMetadata, Snapshot, SnapshotFn, StorageConfig};
use crate::sync::timer::Debouncer;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Document already exists: {0}")]
    AlreadyExists(String),

    #[error("Corruption detected in document: {0}")]
    Corruption(String),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Tree names for different data types
const TREE_DOCUMENTS: &str = "documents";
const TREE_METADATA: &str = "metadata";

/// Sled-based document store
#[derive(Clone)]
pub struct DocumentStore {
    db: Arc<Db>,
    documents: Tree,
    metadata: Tree,
    pending: Arc<Debouncer<String, SnapshotFn>>,
    config: StorageConfig,
}

impl DocumentStore {
    /// Open or create a new document store at the given path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let documents = db.open_tree(TREE_DOCUMENTS)?;
        let metadata = db.open_tree(TREE_METADATA)?;

        Ok(Self {
            db: Arc::new(db),
            documents,
            metadata,
            pending: Arc::new(Debouncer::new(config.save_debounce)),
            config,
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Create a new document with initial content
    pub fn create_document(
        &self,
        doc_name: &str,
        encoded: &str,
    ) -> StorageResult<DocumentMetadata> {
        if self.document_exists(doc_name)? {
            return Err(StorageError::AlreadyExists(doc_name.to_string()));
        }

        let mut meta = DocumentMetadata::new(doc_name);
        meta.size_bytes = encoded.len() as u64;
        self.documents.insert(doc_name.as_bytes(), encoded.as_bytes())?;
        self.save_metadata(&meta)?;
        Ok(meta)
    }

    /// Store a complete document snapshot
    pub fn save_document(&self, doc_name: &str, snapshot: &Snapshot) -> StorageResult<()> {
        self.documents
            .insert(doc_name.as_bytes(), snapshot.doc.as_bytes())?;

        let mut meta = self
            .get_metadata(doc_name)?
            .unwrap_or_else(|| DocumentMetadata::new(doc_name));
        meta.updated_at = chrono::Utc::now().timestamp();
        meta.version = snapshot.version;
        meta.size_bytes = snapshot.doc.len() as u64;
        self.save_metadata(&meta)?;

        Ok(())
    }

    /// Load a complete document snapshot
    pub fn load_document(&self, doc_name: &str) -> StorageResult<Option<String>> {
        match self.documents.get(doc_name.as_bytes())? {
            Some(data) => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|e| StorageError::Corruption(format!("{}: {}", doc_name, e)))?;
                Ok(Some(text))
            }
            None => Ok(None),
        }
    }

    /// Check if a document exists
    pub fn document_exists(&self, doc_name: &str) -> StorageResult<bool> {
        Ok(self.documents.contains_key(doc_name.as_bytes())?)
    }

    /// Save document metadata
    pub fn save_metadata(&self, meta: &DocumentMetadata) -> StorageResult<()> {
        let bytes = bincode::serialize(meta)?;
        self.metadata.insert(meta.doc_name.as_bytes(), bytes)?;
        Ok(())
    }

    /// Load document metadata
    pub fn get_metadata(&self, doc_name: &str) -> StorageResult<Option<DocumentMetadata>> {
        match self.metadata.get(doc_name.as_bytes())? {
            Some(bytes) => {
                let meta: DocumentMetadata = bincode::deserialize(&bytes)?;
                Ok(Some(meta))
            }
            None => Ok(None),
        }
    }

    /// List all documents with metadata
    pub fn list_documents(&self) -> StorageResult<Vec<DocumentMetadata>> {
        let mut docs = Vec::new();
        for item in self.metadata.iter() {
            let (_, value) = item?;
            let meta: DocumentMetadata = bincode::deserialize(&value)?;
            docs.push(meta);
        }
        Ok(docs)
    }

    /// Number of debounced writes not yet performed
    pub fn pending_writes(&self) -> usize {
        self.pending.pending_count()
    }

    /// Force sled to write its buffers to disk
    pub fn flush_db(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Get storage statistics
    pub fn stats(&self) -> StorageStats {
        StorageStats {
            document_count: self.documents.len(),
            total_size_bytes: self.db.size_on_disk().unwrap_or(0),
            pending_writes: self.pending.pending_count(),
        }
    }

    fn write_pending(&self, doc_name: &str) {
        let Some(snapshot_fn) = self.pending.take(&doc_name.to_string()) else {
            return;
        };
        let Some(snapshot) = snapshot_fn() else {
            debug!("Skipping save for {}: document no longer live", doc_name);
            return;
        };
        match self.save_document(doc_name, &snapshot) {
            Ok(()) => debug!("Saved document {} at version {}", doc_name, snapshot.version),
            Err(e) => error!("Failed to save document {}: {}", doc_name, e),
        }
    }
}

#[async_trait]
impl Disk for DocumentStore {
    async fn load(&self, doc_name: &str) -> StorageResult<Option<String>> {
        self.load_document(doc_name)
    }

    fn update(&self, doc_name: &str, snapshot: SnapshotFn) {
        let store = self.clone();
        self.pending
            .schedule(doc_name.to_string(), snapshot, move |name| {
                store.write_pending(&name)
            });
    }

    async fn flush(&self, doc_name: &str, snapshot: Snapshot) -> StorageResult<()> {
        self.pending.cancel(&doc_name.to_string());
        self.save_document(doc_name, &snapshot)?;
        self.flush_db()
    }
}

/// Statistics about the storage
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: u64,
    pub pending_writes: usize,
}
