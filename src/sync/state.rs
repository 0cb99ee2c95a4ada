//! Immutable authority state: document, bounded step history and version.
//!
//! Every operation here is pure. A successful `add_events` returns a new
//! value and leaves the receiver untouched, so a failed batch can never leave
//! a half-applied document behind.

use std::sync::Arc;

use super::schema::Schema;
use super::{ClientId, Fail, SyncResult};

/// Maximum number of steps kept for catching up clients
pub const MAX_STEP_HISTORY: usize = 1000;

/// A step tagged with the client that submitted it
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedStep<T> {
    pub step: T,
    pub client_id: ClientId,
}

/// Steps accepted after some version, plus the current version
#[derive(Debug, Clone, PartialEq)]
pub struct Events<T> {
    pub version: u64,
    pub steps: Vec<T>,
    pub client_ids: Vec<ClientId>,
}

impl<T> Events<T> {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Snapshot of one document's authority
#[derive(Debug, Clone)]
pub struct CollabState<D, T> {
    doc: D,
    steps: Arc<[TaggedStep<T>]>,
    version: u64,
}

impl<D: Clone, T: Clone> CollabState<D, T> {
    /// Fresh state at version 0 with no history
    pub fn new(doc: D) -> Self {
        Self {
            doc,
            steps: Arc::from(Vec::new()),
            version: 0,
        }
    }

    pub fn doc(&self) -> &D {
        &self.doc
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Retained history, oldest first
    pub fn steps(&self) -> &[TaggedStep<T>] {
        &self.steps
    }

    fn check_version(&self, version: u64) -> SyncResult<()> {
        if version > self.version {
            return Err(Fail::InvalidVersion);
        }
        Ok(())
    }

    /// Apply `steps` submitted by `client_id` against base `version`.
    pub fn add_events<S>(
        &self,
        schema: &S,
        version: u64,
        steps: &[T],
        client_id: &str,
    ) -> SyncResult<Self>
    where
        S: Schema<Doc = D, Step = T>,
    {
        self.check_version(version)?;
        if version != self.version {
            return Err(Fail::OutdatedVersion);
        }

        let doc = schema.apply_all(&self.doc, steps)?;

        let total = self.steps.len() + steps.len();
        let skip = total.saturating_sub(MAX_STEP_HISTORY);
        let history: Vec<TaggedStep<T>> = self
            .steps
            .iter()
            .cloned()
            .chain(steps.iter().map(|step| TaggedStep {
                step: step.clone(),
                client_id: client_id.to_string(),
            }))
            .skip(skip)
            .collect();

        Ok(Self {
            doc,
            steps: Arc::from(history),
            version: self.version + steps.len() as u64,
        })
    }

    /// Steps accepted since `version`.
    pub fn get_events(&self, version: u64) -> SyncResult<Events<T>> {
        self.check_version(version)?;

        let behind = (self.version - version) as usize;
        let start = self
            .steps
            .len()
            .checked_sub(behind)
            .ok_or(Fail::HistoryNotAvailable)?;

        let tail = &self.steps[start..];
        Ok(Events {
            version: self.version,
            steps: tail.iter().map(|t| t.step.clone()).collect(),
            client_ids: tail.iter().map(|t| t.client_id.clone()).collect(),
        })
    }
}
