//! Local copy of a document kept by an editing client.
//!
//! The replica holds the last confirmed document and version plus the
//! local steps the authority has not confirmed yet. The visible document is
//! always recomputed as confirmed + unconfirmed, so every replica that has
//! seen the same confirmed steps shows the same result once its own steps
//! are through.

use tracing::debug;

use crate::sync::{ClientId, Schema, StepError};

pub struct Replica<S: Schema> {
    confirmed: S::Doc,
    version: u64,
    unconfirmed: Vec<S::Step>,
    doc: S::Doc,
}

impl<S: Schema> Replica<S> {
    pub fn new(doc: S::Doc, version: u64) -> Self {
        Self {
            confirmed: doc.clone(),
            version,
            unconfirmed: Vec::new(),
            doc,
        }
    }

    /// Document including local steps
    pub fn doc(&self) -> &S::Doc {
        &self.doc
    }

    pub fn confirmed(&self) -> &S::Doc {
        &self.confirmed
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn unconfirmed(&self) -> &[S::Step] {
        &self.unconfirmed
    }

    /// Apply a local edit and queue it for pushing.
    pub fn apply_local(&mut self, schema: &S, step: S::Step) -> Result<(), StepError> {
        self.doc = schema.apply_step(&self.doc, &step)?;
        self.unconfirmed.push(step);
        Ok(())
    }

    /// Take in steps accepted by the authority since our version.
    ///
    /// Leading steps tagged with `own` confirm our oldest unconfirmed steps.
    /// The remaining unconfirmed steps are rebased over the foreign ones;
    /// any that no longer apply are dropped. Returns how many were confirmed.
    pub fn receive(
        &mut self,
        schema: &S,
        version: u64,
        steps: &[S::Step],
        client_ids: &[ClientId],
        own: &str,
    ) -> Result<usize, StepError> {
        let confirmed_doc = schema.apply_all(&self.confirmed, steps)?;

        let ours = client_ids
            .iter()
            .take(self.unconfirmed.len())
            .take_while(|id| id.as_str() == own)
            .count();

        let mut pending: Vec<S::Step> = self.unconfirmed.drain(..).skip(ours).collect();
        for remote in &steps[ours.min(steps.len())..] {
            pending = rebase_over(schema, pending, remote);
        }

        let mut doc = confirmed_doc.clone();
        let mut kept = Vec::with_capacity(pending.len());
        for step in pending {
            match schema.apply_step(&doc, &step) {
                Ok(next) => {
                    doc = next;
                    kept.push(step);
                }
                Err(e) => debug!("Dropping local step that no longer applies: {}", e),
            }
        }

        self.confirmed = confirmed_doc;
        self.version = version;
        self.unconfirmed = kept;
        self.doc = doc;
        Ok(ours)
    }
}

/// Rebase a chain of local steps over one remote step.
///
/// Each local step is moved past the remote step, and the remote step is
/// moved past the local step so the next local step sees it in its own
/// coordinates.
fn rebase_over<S: Schema>(schema: &S, pending: Vec<S::Step>, remote: &S::Step) -> Vec<S::Step> {
    let mut remote = Some(remote.clone());
    let mut rebased = Vec::with_capacity(pending.len());

    for step in pending {
        let Some(over) = remote.as_ref() else {
            rebased.push(step);
            continue;
        };
        let next_remote = schema.rebase_step(over, &step);
        if let Some(moved) = schema.rebase_step(&step, over) {
            rebased.push(moved);
        }
        remote = next_remote;
    }
    rebased
}
