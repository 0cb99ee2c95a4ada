//! Collab Sync - version-ordered collaborative document synchronization.
//!
//! - `sync`: the authority (`CollabState`, `Instance`, `Manager`) and the
//!   wire protocol
//! - `transport`: message bus with ping/pong request correlation
//! - `client`: the reconciliation loop keeping a replica converged
//! - `storage`: sled-backed and in-memory document persistence

pub mod client;
pub mod config;
pub mod storage;
pub mod sync;
pub mod transport;

pub use client::{ClientError, Selection, Session, SessionConfig, SessionEvent, View};
pub use config::{ConfigError, ServerConfig};
pub use storage::{Disk, DocumentStore, MemoryDisk, StorageConfig};
pub use sync::{Fail, Manager, ManagerConfig, Schema, SyncResult, TextSchema, TextStep};
pub use transport::{serve, wrap_request, LocalBus, Transport, WsTransport};
