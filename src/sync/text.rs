//! Plain-text schema: character-indexed replace steps.

use serde::{Deserialize, Serialize};

use super::schema::{Schema, StepError};

/// Replace the characters in `from..to` with `text`.
///
/// Inserts and deletes are the degenerate cases of a replace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStep {
    pub from: usize,
    pub to: usize,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
}

impl TextStep {
    pub fn insert(text: impl Into<String>, at: usize) -> Self {
        Self {
            from: at,
            to: at,
            text: text.into(),
        }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self {
            from,
            to,
            text: String::new(),
        }
    }

    pub fn replace(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self {
            from,
            to,
            text: text.into(),
        }
    }

    fn inserted_len(&self) -> usize {
        self.text.chars().count()
    }

    fn is_noop(&self) -> bool {
        self.from == self.to && self.text.is_empty()
    }

    /// Map a position in the document before this step to the document after it.
    ///
    /// `after` selects which side of inserted text a position lands on when it
    /// touches the replaced range.
    fn map_pos(&self, pos: usize, after: bool) -> usize {
        let len = self.inserted_len();
        if pos < self.from {
            pos
        } else if pos > self.to {
            pos - (self.to - self.from) + len
        } else if pos == self.to && self.to > self.from {
            self.from + len
        } else if after {
            self.from + len
        } else {
            self.from
        }
    }
}

/// Schema for plain text documents
#[derive(Debug, Clone, Copy, Default)]
pub struct TextSchema;

impl Schema for TextSchema {
    type Doc = String;
    type Step = TextStep;

    fn apply_step(&self, doc: &String, step: &TextStep) -> Result<String, StepError> {
        let len = doc.chars().count();
        if step.from > step.to || step.to > len {
            return Err(StepError::OutOfRange {
                from: step.from,
                to: step.to,
                len,
            });
        }

        let mut out = String::with_capacity(doc.len() + step.text.len());
        out.extend(doc.chars().take(step.from));
        out.push_str(&step.text);
        out.extend(doc.chars().skip(step.to));
        Ok(out)
    }

    fn encode_step(&self, step: &TextStep) -> Result<String, StepError> {
        Ok(serde_json::to_string(step)?)
    }

    fn decode_step(&self, encoded: &str) -> Result<TextStep, StepError> {
        Ok(serde_json::from_str(encoded)?)
    }

    fn encode_doc(&self, doc: &String) -> Result<String, StepError> {
        Ok(doc.clone())
    }

    fn decode_doc(&self, encoded: &str) -> Result<String, StepError> {
        Ok(encoded.to_string())
    }

    fn rebase_step(&self, step: &TextStep, over: &TextStep) -> Option<TextStep> {
        // Text inserted by `over` at the same point stays in front of ours.
        let from = over.map_pos(step.from, true);
        let to = over.map_pos(step.to, false).max(from);
        let rebased = TextStep {
            from,
            to,
            text: step.text.clone(),
        };
        (!rebased.is_noop()).then_some(rebased)
    }

    fn doc_len(&self, doc: &String) -> usize {
        doc.chars().count()
    }
}
