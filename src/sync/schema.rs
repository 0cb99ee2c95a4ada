//! The step capability consumed by the authority and the client loop.
//!
//! The core never looks inside a document or a step. Everything it needs is
//! expressed by [`Schema`]: applying a step, encoding steps and documents for
//! transport, and rebasing a step over a concurrent one.

use thiserror::Error;

/// Errors produced by a schema
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Step range {from}..{to} out of bounds for document of length {len}")]
    OutOfRange { from: usize, to: usize, len: usize },

    #[error("Invalid step: {0}")]
    Invalid(String),

    #[error("Codec error: {0}")]
    Codec(String),
}

impl From<serde_json::Error> for StepError {
    fn from(err: serde_json::Error) -> Self {
        StepError::Codec(err.to_string())
    }
}

/// Document and step capability.
///
/// Encoded forms are plain strings so they can travel through every
/// transport (binary frames, JSON, HTTP bodies) unchanged.
pub trait Schema: Send + Sync + 'static {
    type Doc: Clone + Send + Sync + 'static;
    type Step: Clone + Send + Sync + 'static;

    /// Apply one step, yielding a new snapshot.
    fn apply_step(&self, doc: &Self::Doc, step: &Self::Step) -> Result<Self::Doc, StepError>;

    fn encode_step(&self, step: &Self::Step) -> Result<String, StepError>;

    fn decode_step(&self, encoded: &str) -> Result<Self::Step, StepError>;

    fn encode_doc(&self, doc: &Self::Doc) -> Result<String, StepError>;

    fn decode_doc(&self, encoded: &str) -> Result<Self::Doc, StepError>;

    /// Rewrite `step` so it applies after `over`, where both were made
    /// against the same document and `over` is ordered first.
    ///
    /// Returns `None` when the step no longer has any effect.
    fn rebase_step(&self, step: &Self::Step, over: &Self::Step) -> Option<Self::Step>;

    /// Number of addressable positions, used to restore selections.
    fn doc_len(&self, doc: &Self::Doc) -> usize;

    /// Apply a batch in order; the first failure aborts the whole batch.
    fn apply_all(&self, doc: &Self::Doc, steps: &[Self::Step]) -> Result<Self::Doc, StepError> {
        let mut current = doc.clone();
        for step in steps {
            current = self.apply_step(&current, step)?;
        }
        Ok(current)
    }
}
