//! Per-document persistence writer.
//!
//! Jobs run one at a time, in submission order, on the blocking pool. Log
//! appends queued before a checkpoint are therefore durable before the
//! checkpoint compacts them. Every job produces exactly one outcome.

use std::sync::Arc;

use collabwrite_core::Committed;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::storage::{Checkpoint, PersistenceGateway, StoreError};

#[derive(Debug)]
pub(crate) enum WriteJob {
    Append(Vec<Committed>),
    Checkpoint {
        checkpoint: Checkpoint,
        /// Also record a version, keeping this many
        keep_version: Option<usize>,
    },
}

#[derive(Debug)]
pub(crate) enum WriteOutcome {
    Appended { through: u64 },
    AppendFailed { entries: Vec<Committed>, error: StoreError },
    Saved { revision: u64, versioned: bool },
    SaveFailed { revision: u64, error: StoreError },
}

impl WriteJob {
    fn failed(&self, error: StoreError) -> WriteOutcome {
        match self {
            WriteJob::Append(entries) => WriteOutcome::AppendFailed {
                entries: entries.clone(),
                error,
            },
            WriteJob::Checkpoint { checkpoint, .. } => WriteOutcome::SaveFailed {
                revision: checkpoint.revision,
                error,
            },
        }
    }

    fn run(&self, store: &dyn PersistenceGateway, document_id: Uuid) -> WriteOutcome {
        match self {
            WriteJob::Append(entries) => match store.append_log(document_id, entries) {
                Ok(()) => WriteOutcome::Appended {
                    through: entries.last().map_or(0, |c| c.revision),
                },
                Err(e) => self.failed(e),
            },
            WriteJob::Checkpoint {
                checkpoint,
                keep_version,
            } => {
                if let Err(e) = store.save(document_id, checkpoint) {
                    return self.failed(e);
                }
                let versioned = match keep_version {
                    Some(keep) => match store.save_version(document_id, checkpoint, *keep) {
                        Ok(()) => true,
                        Err(e) => {
                            log::warn!(
                                "Version at revision {} for doc {document_id} not saved: {e}",
                                checkpoint.revision
                            );
                            false
                        }
                    },
                    None => false,
                };
                WriteOutcome::Saved {
                    revision: checkpoint.revision,
                    versioned,
                }
            }
        }
    }
}

/// Handle to the writer task of one document actor.
pub(crate) struct PersistenceWriter {
    jobs: mpsc::UnboundedSender<WriteJob>,
    handle: JoinHandle<()>,
}

impl PersistenceWriter {
    /// Spawn the writer. Outcomes arrive on the returned receiver.
    pub(crate) fn spawn(
        document_id: Uuid,
        store: Arc<dyn PersistenceGateway>,
    ) -> (Self, mpsc::UnboundedReceiver<WriteOutcome>) {
        let (jobs, mut job_rx) = mpsc::unbounded_channel::<WriteJob>();
        let (outcome_tx, outcome_rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(async move {
            while let Some(job) = job_rx.recv().await {
                let job = Arc::new(job);
                let result = {
                    let store = Arc::clone(&store);
                    let job = Arc::clone(&job);
                    tokio::task::spawn_blocking(move || job.run(store.as_ref(), document_id)).await
                };
                let outcome = result.unwrap_or_else(|e| {
                    log::error!("Persistence job for doc {document_id} panicked: {e}");
                    job.failed(StoreError::Database("persistence job panicked".into()))
                });
                if outcome_tx.send(outcome).is_err() {
                    log::debug!("Writer for doc {document_id} has no listener");
                }
            }
            log::trace!("Writer for doc {document_id} drained");
        });

        (Self { jobs, handle }, outcome_rx)
    }

    /// Queue a job. Returns `false` if the writer task is gone.
    pub(crate) fn submit(&self, job: WriteJob) -> bool {
        self.jobs.send(job).is_ok()
    }

    /// Finish every queued job, then stop.
    pub(crate) async fn close(self) {
        drop(self.jobs);
        if let Err(e) = self.handle.await {
            log::error!("Writer task failed: {e}");
        }
    }
}
