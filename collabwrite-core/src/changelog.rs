//! In-memory change log: the committed operations of one document.
//!
//! The log holds a bounded window of the most recent commits:
//!
//! ```text
//!   base_revision = 40                        head = 43
//!        │                                      │
//!        ▼                                      ▼
//!   ─────┼──────────┬──────────┬────────────────┤
//!   (trimmed)  rev 41     rev 42     rev 43
//! ```
//!
//! Operations computed against a revision inside the window can be rebased
//! over everything after it. Older ones cannot; the caller has to
//! resynchronise the client from a snapshot instead.

use std::collections::VecDeque;

use thiserror::Error;

use crate::codec::CodecError;
use crate::delta::{Delta, OtError};
use crate::document::DocumentState;
use crate::operation::{Committed, Operation};
use crate::transform::transform_deltas;

/// Change log errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("expected revision {expected}, got {actual}")]
    OutOfOrder { expected: u64, actual: u64 },
    #[error("revision {requested} is older than the retained history (oldest {oldest})")]
    Trimmed { requested: u64, oldest: u64 },
    #[error("revision {requested} is ahead of the log head {head}")]
    Future { requested: u64, head: u64 },
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Strictly ordered, gap-free sequence of committed operations.
#[derive(Debug, Clone, Default)]
pub struct ChangeLog {
    /// Revision just before the first retained entry
    base_revision: u64,
    entries: VecDeque<Committed>,
}

impl ChangeLog {
    /// An empty log whose next commit will be `base_revision + 1`.
    pub fn new(base_revision: u64) -> Self {
        Self {
            base_revision,
            entries: VecDeque::new(),
        }
    }

    /// Revision of the latest commit.
    pub fn head(&self) -> u64 {
        self.base_revision + self.entries.len() as u64
    }

    /// Oldest revision operations can still be rebased from.
    pub fn base_revision(&self) -> u64 {
        self.base_revision
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the next commit. Revisions must follow on without gaps.
    pub fn append(&mut self, committed: Committed) -> Result<(), LogError> {
        let expected = self.head() + 1;
        if committed.revision != expected {
            return Err(LogError::OutOfOrder {
                expected,
                actual: committed.revision,
            });
        }
        self.entries.push_back(committed);
        Ok(())
    }

    /// Commits with a revision greater than `revision`, oldest first.
    pub fn since(&self, revision: u64) -> Result<impl Iterator<Item = &Committed> + '_, LogError> {
        if revision > self.head() {
            return Err(LogError::Future {
                requested: revision,
                head: self.head(),
            });
        }
        if revision < self.base_revision {
            return Err(LogError::Trimmed {
                requested: revision,
                oldest: self.base_revision,
            });
        }
        let skip = (revision - self.base_revision) as usize;
        Ok(self.entries.range(skip..))
    }

    /// Compose every commit after `revision` into a single delta.
    ///
    /// Returns `None` when `revision` is already the head.
    pub fn compose_since(&self, revision: u64) -> Result<Option<Delta>, LogError> {
        let mut composed: Option<Delta> = None;
        for committed in self.since(revision)? {
            composed = Some(match composed {
                None => committed.delta().clone(),
                Some(acc) => acc.compose(committed.delta())?,
            });
        }
        Ok(composed)
    }

    /// Rebase `operation` onto the head of the log.
    ///
    /// The operation is transformed against each commit the submitter had
    /// not seen, one at a time and in order, exactly as the submitter's
    /// replica transforms those commits against its pending edit. The
    /// returned operation carries the head revision.
    pub fn rebase(&self, operation: &Operation) -> Result<Operation, LogError> {
        let mut delta = operation.delta.clone();
        for committed in self.since(operation.revision)? {
            let submitter_first = operation.client_id < *committed.client_id();
            delta = transform_deltas(&delta, committed.delta(), submitter_first)?.0;
        }

        Ok(Operation {
            client_id: operation.client_id.clone(),
            seq: operation.seq,
            revision: self.head(),
            delta,
        })
    }

    /// Look up a commit by revision.
    pub fn get(&self, revision: u64) -> Option<&Committed> {
        if revision <= self.base_revision {
            return None;
        }
        self.entries.get((revision - self.base_revision - 1) as usize)
    }

    /// Drop the oldest entries so that at most `limit` remain.
    pub fn trim_to(&mut self, limit: usize) {
        if self.entries.len() <= limit {
            return;
        }
        while self.entries.len() > limit {
            self.entries.pop_front();
            self.base_revision += 1;
        }
        log::trace!("Change log trimmed, oldest rebase point is now {}", self.base_revision);
    }

    /// Apply the commits after `state.revision()` to `state`.
    ///
    /// Returns the number of operations applied.
    pub fn replay_onto(&self, state: &mut DocumentState) -> Result<usize, LogError> {
        let mut applied = 0;
        for committed in self.since(state.revision())? {
            state.apply(committed.delta())?;
            applied += 1;
        }
        Ok(applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(revision: u64, delta: Delta) -> Committed {
        Committed {
            revision,
            operation: Operation::new("client", revision, revision - 1, delta),
        }
    }

    /// "a", "ab", "abc", ...
    fn typing_log(count: u64) -> ChangeLog {
        let mut log = ChangeLog::new(0);
        for i in 0..count {
            let ch = char::from(b'a' + i as u8).to_string();
            let delta = Delta::new().retain(i as usize).insert(&ch);
            log.append(commit(i + 1, delta)).unwrap();
        }
        log
    }

    #[test]
    fn test_append_in_order() {
        let log = typing_log(3);
        assert_eq!(log.head(), 3);
        assert_eq!(log.len(), 3);
        assert_eq!(log.get(2).map(|c| c.revision), Some(2));
        assert!(log.get(0).is_none());
        assert!(log.get(4).is_none());
    }

    #[test]
    fn test_append_gap_rejected() {
        let mut log = typing_log(2);
        let err = log.append(commit(4, Delta::new().retain(2))).unwrap_err();
        assert_eq!(err, LogError::OutOfOrder { expected: 3, actual: 4 });
        assert_eq!(log.head(), 2);
    }

    #[test]
    fn test_since_bounds() {
        let mut log = typing_log(5);
        assert_eq!(log.since(2).unwrap().count(), 3);
        assert_eq!(log.since(5).unwrap().count(), 0);
        assert!(matches!(log.since(6), Err(LogError::Future { requested: 6, head: 5 })));

        log.trim_to(2);
        assert_eq!(log.base_revision(), 3);
        assert!(matches!(log.since(2), Err(LogError::Trimmed { requested: 2, oldest: 3 })));
        assert_eq!(log.since(3).unwrap().count(), 2);
    }

    #[test]
    fn test_compose_since() {
        let log = typing_log(4);
        let composed = log.compose_since(1).unwrap().unwrap();
        let mut doc = DocumentState::from_text("a");
        doc.apply(&composed).unwrap();
        assert_eq!(doc.text(), "abcd");
        assert!(log.compose_since(4).unwrap().is_none());
    }

    #[test]
    fn test_rebase_keeps_per_origin_priority() {
        // "b" and "d" both inserted at 0 after the submitter's revision.
        let mut log = ChangeLog::new(0);
        let first = Operation::new("b", 1, 0, Delta::new().insert("B"));
        log.append(Committed { revision: 1, operation: first }).unwrap();
        let second = Operation::new("d", 1, 1, Delta::new().insert("D").retain(1));
        log.append(Committed { revision: 2, operation: second }).unwrap();

        let submitted = Operation::new("c", 1, 0, Delta::new().insert("C"));
        let rebased = log.rebase(&submitted).unwrap();
        assert_eq!(rebased.revision, 2);

        let mut doc = DocumentState::from_text("DB");
        doc.apply(&rebased.delta).unwrap();
        // "b" < "c" goes before C; "d" > "c" goes after.
        assert_eq!(doc.text(), "DBC");
        assert_eq!(rebased.delta, Delta::new().retain(2).insert("C"));
    }

    #[test]
    fn test_rebase_matches_submitter_replica() {
        // "ab": m deletes everything, then n inserts into the empty document.
        let mut log = ChangeLog::new(0);
        let m = Operation::new("m", 1, 0, Delta::new().delete(2));
        log.append(Committed { revision: 1, operation: m.clone() }).unwrap();
        let n = Operation::new("n", 1, 1, Delta::new().insert("Y"));
        log.append(Committed { revision: 2, operation: n.clone() }).unwrap();

        // "a" typed between the two characters before seeing either commit.
        let submitted = Operation::new("a", 1, 0, Delta::new().retain(1).insert("Z").retain(1));
        let rebased = log.rebase(&submitted).unwrap();
        let mut server = DocumentState::from_text("ab");
        server.apply(&m.delta).unwrap();
        server.apply(&n.delta).unwrap();
        server.apply(&rebased.delta).unwrap();

        // The submitter applied its edit first, then each remote commit
        // transformed against what was still pending.
        let mut replica = DocumentState::from_text("ab");
        replica.apply(&submitted.delta).unwrap();
        let mut pending = submitted.delta.clone();
        for remote in [&m, &n] {
            let (local, transformed) = transform_deltas(&pending, &remote.delta, true).unwrap();
            replica.apply(&transformed).unwrap();
            pending = local;
        }

        assert_eq!(server.text(), "ZY");
        assert_eq!(replica.text(), server.text());
    }

    #[test]
    fn test_rebase_current_revision_is_unchanged() {
        let log = typing_log(2);
        let submitted = Operation::new("x", 1, 2, Delta::new().retain(2).insert("!"));
        assert_eq!(log.rebase(&submitted).unwrap(), submitted);
    }

    #[test]
    fn test_rebase_trimmed_revision_fails() {
        let mut log = typing_log(4);
        log.trim_to(1);
        let submitted = Operation::new("x", 1, 1, Delta::new().retain(1));
        assert!(matches!(log.rebase(&submitted), Err(LogError::Trimmed { .. })));
    }

    #[test]
    fn test_replay_onto() {
        let log = typing_log(6);
        let mut doc = DocumentState::from_parts(2, Delta::from_text("ab")).unwrap();
        assert_eq!(log.replay_onto(&mut doc).unwrap(), 4);
        assert_eq!(doc.text(), "abcdef");
        assert_eq!(doc.revision(), 6);
    }
}
