//! In-process store with switchable failure injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use collabwrite_core::Committed;
use uuid::Uuid;

use super::{Checkpoint, PersistenceGateway, StoreError};

#[derive(Debug, Default)]
struct Inner {
    checkpoints: HashMap<Uuid, Checkpoint>,
    logs: HashMap<Uuid, BTreeMap<u64, Committed>>,
    /// Newest last
    versions: HashMap<Uuid, Vec<Checkpoint>>,
}

/// Volatile [`PersistenceGateway`] for tests and storage-less servers.
///
/// `fail_saves` and `fail_appends` make the corresponding calls return
/// [`StoreError::Injected`] until switched off again.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_saves: AtomicBool,
    fail_appends: AtomicBool,
    saves: AtomicU64,
    failed_saves: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Successful checkpoint saves so far.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn failed_save_count(&self) -> u64 {
        self.failed_saves.load(Ordering::SeqCst)
    }

    /// Number of log entries currently retained for a document.
    pub fn log_len(&self, document_id: Uuid) -> usize {
        self.lock()
            .map(|inner| inner.logs.get(&document_id).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl PersistenceGateway for MemoryStore {
    fn load_latest(&self, document_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.lock()?.checkpoints.get(&document_id).cloned())
    }

    fn save(&self, document_id: Uuid, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            self.failed_saves.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::Injected("save"));
        }

        let mut inner = self.lock()?;
        if let Some(stored) = inner.checkpoints.get(&document_id) {
            if stored.revision > checkpoint.revision {
                return Err(StoreError::StaleCheckpoint {
                    document_id,
                    stored: stored.revision,
                    offered: checkpoint.revision,
                });
            }
        }
        inner.checkpoints.insert(document_id, checkpoint.clone());
        if let Some(log) = inner.logs.get_mut(&document_id) {
            *log = log.split_off(&(checkpoint.revision + 1));
        }
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn append_log(&self, document_id: Uuid, entries: &[Committed]) -> Result<(), StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("append_log"));
        }
        let mut inner = self.lock()?;
        let log = inner.logs.entry(document_id).or_default();
        for committed in entries {
            log.insert(committed.revision, committed.clone());
        }
        Ok(())
    }

    fn load_log_since(
        &self,
        document_id: Uuid,
        revision: u64,
    ) -> Result<Vec<Committed>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .logs
            .get(&document_id)
            .map(|log| log.range(revision + 1..).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    fn truncate_log_after(&self, document_id: Uuid, revision: u64) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        if let Some(log) = inner.logs.get_mut(&document_id) {
            log.retain(|logged, _| *logged <= revision);
        }
        Ok(())
    }

    fn save_version(
        &self,
        document_id: Uuid,
        checkpoint: &Checkpoint,
        keep: usize,
    ) -> Result<(), StoreError> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::Injected("save_version"));
        }
        let mut inner = self.lock()?;
        let versions = inner.versions.entry(document_id).or_default();
        versions.push(checkpoint.clone());
        if versions.len() > keep {
            let excess = versions.len() - keep;
            versions.drain(..excess);
        }
        Ok(())
    }

    fn list_versions(&self, document_id: Uuid) -> Result<Vec<Checkpoint>, StoreError> {
        let inner = self.lock()?;
        Ok(inner
            .versions
            .get(&document_id)
            .map(|versions| versions.iter().rev().cloned().collect())
            .unwrap_or_default())
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.lock()?;
        let mut ids: Vec<Uuid> = inner
            .checkpoints
            .keys()
            .chain(inner.logs.keys())
            .copied()
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}
