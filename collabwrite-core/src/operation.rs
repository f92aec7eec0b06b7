//! Operations: a delta tagged with its origin and base revision.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::delta::Delta;

/// Opaque participant identity supplied by the caller.
///
/// Ordering matters: when two clients insert at the same offset, the
/// lexicographically lower id goes first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An edit computed by one client against a known document revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Origin participant
    pub client_id: ClientId,
    /// Per-client sequence number, used to spot resubmissions
    pub seq: u64,
    /// Revision of the document the delta was computed against
    pub revision: u64,
    pub delta: Delta,
}

impl Operation {
    pub fn new(client_id: impl Into<ClientId>, seq: u64, revision: u64, delta: Delta) -> Self {
        Self {
            client_id: client_id.into(),
            seq,
            revision,
            delta,
        }
    }

    /// Whether this operation's inserts go first when tied with `other`'s.
    pub fn has_priority_over(&self, other: &Operation) -> bool {
        self.client_id < other.client_id
    }
}

/// An operation accepted into a document's change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Committed {
    /// Revision produced by this operation (`operation.revision + 1`)
    pub revision: u64,
    pub operation: Operation,
}

impl Committed {
    pub fn client_id(&self) -> &ClientId {
        &self.operation.client_id
    }

    pub fn delta(&self) -> &Delta {
        &self.operation.delta
    }
}
