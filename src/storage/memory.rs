//! In-memory `Disk` for tests and embedded use.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::{Disk, Snapshot, SnapshotFn, StorageResult};

/// Keeps documents in a map and counts every call.
///
/// `update` snapshots immediately; there is nothing to coalesce in memory.
#[derive(Default)]
pub struct MemoryDisk {
    docs: DashMap<String, Snapshot>,
    loads: AtomicUsize,
    updates: AtomicUsize,
    flushes: AtomicUsize,
    load_delay: Option<Duration>,
}

impl MemoryDisk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document at version 0
    pub fn with_doc(self, doc_name: impl Into<String>, encoded: impl Into<String>) -> Self {
        self.insert(doc_name, encoded);
        self
    }

    /// Make every `load` take `delay`
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = Some(delay);
        self
    }

    pub fn insert(&self, doc_name: impl Into<String>, encoded: impl Into<String>) {
        self.docs.insert(
            doc_name.into(),
            Snapshot {
                doc: encoded.into(),
                version: 0,
            },
        );
    }

    pub fn get(&self, doc_name: &str) -> Option<Snapshot> {
        self.docs.get(doc_name).map(|s| s.clone())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn update_count(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Disk for MemoryDisk {
    async fn load(&self, doc_name: &str) -> StorageResult<Option<String>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.load_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.docs.get(doc_name).map(|s| s.doc.clone()))
    }

    fn update(&self, doc_name: &str, snapshot: SnapshotFn) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        if let Some(snapshot) = snapshot() {
            self.docs.insert(doc_name.to_string(), snapshot);
        }
    }

    async fn flush(&self, doc_name: &str, snapshot: Snapshot) -> StorageResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.docs.insert(doc_name.to_string(), snapshot);
        Ok(())
    }
}
