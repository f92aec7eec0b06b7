//! Authoritative document content at a revision.

use serde::{Deserialize, Serialize};

use crate::delta::{Delta, OtError};

/// Document content plus the number of operations applied to reach it.
///
/// `content` is always insert-only. Revision 0 is the empty document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentState {
    revision: u64,
    content: Delta,
}

impl DocumentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a document from a checkpoint.
    pub fn from_parts(revision: u64, content: Delta) -> Result<Self, OtError> {
        if !content.is_insert_only() {
            return Err(OtError::NotInsertOnly);
        }
        Ok(Self { revision, content })
    }

    /// Plain-text document at revision 0.
    pub fn from_text(text: &str) -> Self {
        Self {
            revision: 0,
            content: Delta::from_text(text),
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    /// Length in positions (chars plus embeds).
    pub fn len(&self) -> usize {
        self.content.target_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }

    /// Apply a delta spanning the whole document and bump the revision.
    ///
    /// On error the document is left untouched.
    pub fn apply(&mut self, delta: &Delta) -> Result<u64, OtError> {
        if delta.base_len() != self.len() {
            return Err(OtError::BaseLength {
                expected: self.len(),
                actual: delta.base_len(),
            });
        }
        self.content = self.content.compose(delta)?;
        self.revision += 1;
        Ok(self.revision)
    }
}
