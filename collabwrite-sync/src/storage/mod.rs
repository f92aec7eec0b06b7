//! Persistence gateway: checkpoints, the trailing change log and versions.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐  append_log   ┌─────────────────────────────────┐
//! │ DocumentActor    │ ────────────► │ PersistenceGateway              │
//! │ (writer task,    │  save         │                                 │
//! │  spawn_blocking) │ ────────────► │  RocksStore   MemoryStore       │
//! └──────────────────┘               └──────┬──────────────────────────┘
//!                                           │ column families
//!                                           ▼
//!                     ┌──────────────────────────────────────────┐
//!                     │ CF "checkpoints": latest snapshot        │
//!                     │ CF "oplog"      : committed operations   │
//!                     │ CF "versions"   : named version history  │
//!                     │ CF "metadata"   : per-document metadata  │
//!                     └──────────────────────────────────────────┘
//! ```
//!
//! Recovery: load the latest checkpoint, then replay the log entries after
//! its revision. Log entries at or below a checkpoint's revision are
//! compacted once the checkpoint has been written.
//!
//! Gateway calls are synchronous. The coordinator runs them on the blocking
//! pool so disk I/O never stalls the document actors.

pub mod memory;
pub mod rocks;

use std::time::SystemTime;

use collabwrite_core::{Committed, Delta, DocumentState, OtError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

/// Durable snapshot of a document at a known revision.
///
/// Replaying every committed operation with a revision greater than
/// `revision` onto `content` reproduces the live document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub document_id: Uuid,
    pub revision: u64,
    /// Insert-only delta
    pub content: Delta,
    /// Seconds since the Unix epoch
    pub created_at: u64,
}

impl Checkpoint {
    pub fn new(document_id: Uuid, state: &DocumentState) -> Self {
        Self {
            document_id,
            revision: state.revision(),
            content: state.content().clone(),
            created_at: unix_now(),
        }
    }

    /// Rebuild the document state this checkpoint describes.
    pub fn to_state(&self) -> Result<DocumentState, OtError> {
        DocumentState::from_parts(self.revision, self.content.clone())
    }
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("stale checkpoint for {document_id}: stored revision {stored}, offered {offered}")]
    StaleCheckpoint {
        document_id: Uuid,
        stored: u64,
        offered: u64,
    },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    /// Failure injected by [`MemoryStore`]
    #[error("injected failure: {0}")]
    Injected(&'static str),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<collabwrite_core::CodecError> for StoreError {
    fn from(e: collabwrite_core::CodecError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Storage boundary used by the synchronization coordinator.
///
/// Every call is fallible and may be retried. Implementations must keep
/// checkpoint revisions monotonic per document.
pub trait PersistenceGateway: Send + Sync {
    /// Latest checkpoint, or `None` for a document never saved.
    fn load_latest(&self, document_id: Uuid) -> Result<Option<Checkpoint>, StoreError>;

    /// Replace the stored checkpoint.
    ///
    /// A checkpoint older than the stored one is rejected with
    /// [`StoreError::StaleCheckpoint`]. On success, log entries at or below
    /// `checkpoint.revision` are compacted.
    fn save(&self, document_id: Uuid, checkpoint: &Checkpoint) -> Result<(), StoreError>;

    /// Append committed operations to the durable log.
    fn append_log(&self, document_id: Uuid, entries: &[Committed]) -> Result<(), StoreError>;

    /// Logged operations with a revision greater than `revision`, in order.
    fn load_log_since(
        &self,
        document_id: Uuid,
        revision: u64,
    ) -> Result<Vec<Committed>, StoreError>;

    /// Drop logged operations with a revision greater than `revision`.
    fn truncate_log_after(&self, document_id: Uuid, revision: u64) -> Result<(), StoreError>;

    /// Record a named version, keeping only the newest `keep`.
    fn save_version(
        &self,
        document_id: Uuid,
        checkpoint: &Checkpoint,
        keep: usize,
    ) -> Result<(), StoreError>;

    /// Stored versions, newest first.
    fn list_versions(&self, document_id: Uuid) -> Result<Vec<Checkpoint>, StoreError>;

    /// Every document with a checkpoint or log entry.
    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Result of [`recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovered {
    pub state: DocumentState,
    /// Revision of the checkpoint recovery started from
    pub checkpoint_revision: u64,
    /// Log entries replayed on top of the checkpoint
    pub replayed: Vec<Committed>,
}

/// Rebuild a document from its checkpoint and the log tail after it.
///
/// Replay stops at the first gap or at an entry that does not apply; the
/// document is then served from the last contiguous revision and the log
/// after it is truncated, so new commits never land next to stale ones.
pub fn recover(store: &dyn PersistenceGateway, document_id: Uuid) -> Result<Recovered, StoreError> {
    let mut state = match store.load_latest(document_id)? {
        Some(checkpoint) => checkpoint
            .to_state()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        None => DocumentState::new(),
    };
    let checkpoint_revision = state.revision();

    let mut replayed = Vec::new();
    let mut stopped = false;
    for committed in store.load_log_since(document_id, checkpoint_revision)? {
        if committed.revision != state.revision() + 1 {
            log::warn!(
                "Log gap for doc {document_id}: expected revision {}, found {}; replay stopped",
                state.revision() + 1,
                committed.revision
            );
            stopped = true;
            break;
        }
        if let Err(e) = state.apply(committed.delta()) {
            log::warn!(
                "Log entry {} for doc {document_id} does not apply: {e}; replay stopped",
                committed.revision
            );
            stopped = true;
            break;
        }
        replayed.push(committed);
    }
    if stopped {
        store.truncate_log_after(document_id, state.revision())?;
    }

    if !replayed.is_empty() {
        log::info!(
            "Recovered doc {document_id} at revision {} ({} entries after {checkpoint_revision})",
            state.revision(),
            replayed.len()
        );
    }

    Ok(Recovered {
        state,
        checkpoint_revision,
        replayed,
    })
}

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
