//! Server-side synchronization authority.
//!
//! This module implements the version-ordered collaboration core:
//! - Immutable `CollabState` snapshots with bounded step history
//! - Per-document `Instance` sessions with long-poll waiters and presence
//! - A `Manager` routing requests and owning instance lifecycle
//! - The wire protocol shared by the server and the client loop

pub mod instance;
pub mod manager;
pub mod protocol;
pub mod schema;
pub mod state;
pub mod text;
pub mod timer;

pub use instance::Instance;
pub use manager::{Manager, ManagerConfig};
pub use schema::{Schema, StepError};
pub use state::{CollabState, Events, MAX_STEP_HISTORY};
pub use text::{TextSchema, TextStep};

use serde::{Deserialize, Serialize};

/// Name of a shared document
pub type DocName = String;

/// Identifier of a connected user (presence)
pub type UserId = String;

/// Identifier of an editing client, used to tag accepted steps
pub type ClientId = String;

/// Result type for authority operations
pub type SyncResult<T> = Result<T, Fail>;

/// Closed set of failures returned by the authority and the transport.
///
/// `OutdatedVersion` and `ManagerUnresponsive` are routine and recovered by
/// the client loop; the others force a resync or are reported upward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum Fail {
    #[error("Invalid version")]
    InvalidVersion,

    #[error("Version is outdated")]
    OutdatedVersion,

    #[error("Failed to apply steps: {0}")]
    ApplyFailed(String),

    #[error("History no longer available")]
    HistoryNotAvailable,

    #[error("Incorrect manager")]
    IncorrectManager,

    #[error("Document not found: {0}")]
    DocumentNotFound(DocName),

    #[error("Manager did not respond in time")]
    ManagerUnresponsive,

    #[error("Server no longer available")]
    ManagerDestroyed,

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<StepError> for Fail {
    fn from(err: StepError) -> Self {
        Fail::ApplyFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_display() {
        let err = Fail::DocumentNotFound("notes".to_string());
        assert_eq!(err.to_string(), "Document not found: notes");
        assert_eq!(Fail::ManagerDestroyed.to_string(), "Server no longer available");
    }

    #[test]
    fn test_step_error_maps_to_apply_failed() {
        let fail: Fail = StepError::OutOfRange { from: 4, to: 9, len: 3 }.into();
        assert!(matches!(fail, Fail::ApplyFailed(_)));
    }
}
