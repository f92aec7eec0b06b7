//! The single writer of one document.
//!
//! Each open document is owned by a tokio task that processes commands
//! one at a time, so revisions are assigned without locks:
//!
//! ```text
//!  Coordinator ──Command──► DocumentActor ──DocumentEvent──► subscribers
//!                               │  ▲
//!                      WriteJob │  │ WriteOutcome
//!                               ▼  │
//!                          PersistenceWriter ──► PersistenceGateway
//! ```
//!
//! The actor stops on its own once nobody is subscribed, everything is
//! persisted and it has been idle for `idle_timeout`. Commands that were
//! still queued at that point are dropped unanswered; the coordinator
//! respawns the actor and retries.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use collabwrite_core::{ChangeLog, ClientId, Committed, DocumentState, Operation};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::writer::{PersistenceWriter, WriteJob, WriteOutcome};
use super::{CoordinatorConfig, DocumentStats, SubmitError, Submitted, Subscription};
use crate::broadcast::{BroadcastGroup, DocumentEvent};
use crate::protocol::SaveStatus;
use crate::storage::{self, Checkpoint, PersistenceGateway, Recovered, StoreError};

/// Commits remembered per client for resubmission lookups.
const SEQUENCE_WINDOW: usize = 32;

pub(crate) enum Command {
    Submit {
        operation: Operation,
        reply: oneshot::Sender<Result<Submitted, SubmitError>>,
    },
    Subscribe {
        participant_id: String,
        known_revision: Option<u64>,
        reply: oneshot::Sender<Subscription>,
    },
    Snapshot {
        reply: oneshot::Sender<DocumentState>,
    },
    Publish(DocumentEvent),
    Flush {
        reply: oneshot::Sender<Result<u64, StoreError>>,
    },
    Stats {
        reply: oneshot::Sender<DocumentStats>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Recent commits of one client, for answering resubmissions.
#[derive(Debug, Default)]
struct SeenSequences {
    highest: u64,
    recent: VecDeque<Arc<Committed>>,
}

impl SeenSequences {
    fn record(&mut self, committed: Arc<Committed>) {
        self.highest = self.highest.max(committed.operation.seq);
        self.recent.push_back(committed);
        while self.recent.len() > SEQUENCE_WINDOW {
            self.recent.pop_front();
        }
    }

    fn find(&self, seq: u64) -> Option<&Arc<Committed>> {
        self.recent.iter().rev().find(|c| c.operation.seq == seq)
    }

    fn newest_revision(&self) -> u64 {
        self.recent.back().map_or(0, |c| c.revision)
    }
}

/// Forget clients whose newest commit is at or below `base_revision`.
///
/// Any resubmission from such a client is based on a revision the log no
/// longer holds and is answered with a resync instead.
fn prune_sequences(sequences: &mut HashMap<ClientId, SeenSequences>, base_revision: u64) {
    sequences.retain(|_, seen| seen.newest_revision() > base_revision);
}

pub(crate) struct DocumentActor {
    document_id: Uuid,
    config: CoordinatorConfig,
    state: DocumentState,
    log: ChangeLog,
    sequences: HashMap<ClientId, SeenSequences>,
    broadcast: BroadcastGroup,
    commands: mpsc::Receiver<Command>,
    writer: Option<PersistenceWriter>,
    outcomes: mpsc::UnboundedReceiver<WriteOutcome>,
    /// Jobs queued on the writer without an outcome yet
    pending_writes: usize,
    /// Commits whose log append failed, retried on tick
    unlogged: Vec<Committed>,
    saved_revision: u64,
    checkpoint_in_flight: bool,
    last_checkpoint_at: Instant,
    last_version_at: Instant,
    last_activity: Instant,
    flush_waiters: Vec<(u64, oneshot::Sender<Result<u64, StoreError>>)>,
}

/// Start the actor for `document_id`. Recovery runs inside the task, so
/// commands sent right away simply wait for it.
pub(crate) fn spawn(
    document_id: Uuid,
    config: CoordinatorConfig,
    store: Arc<dyn PersistenceGateway>,
) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(config.command_capacity.max(1));

    tokio::spawn(async move {
        let recovered = {
            let store = Arc::clone(&store);
            tokio::task::spawn_blocking(move || storage::recover(store.as_ref(), document_id)).await
        };
        let recovered = match recovered {
            Ok(Ok(recovered)) => recovered,
            Ok(Err(e)) => {
                log::error!("Recovery of doc {document_id} failed: {e}");
                return;
            }
            Err(e) => {
                log::error!("Recovery task for doc {document_id} failed: {e}");
                return;
            }
        };
        DocumentActor::new(document_id, config, store, recovered, rx).run().await;
    });

    tx
}

impl DocumentActor {
    fn new(
        document_id: Uuid,
        config: CoordinatorConfig,
        store: Arc<dyn PersistenceGateway>,
        recovered: Recovered,
        commands: mpsc::Receiver<Command>,
    ) -> Self {
        let mut log = ChangeLog::new(recovered.checkpoint_revision);
        let mut sequences: HashMap<ClientId, SeenSequences> = HashMap::new();
        for committed in recovered.replayed {
            sequences
                .entry(committed.client_id().clone())
                .or_default()
                .record(Arc::new(committed.clone()));
            if let Err(e) = log.append(committed) {
                log::error!("Replayed log for doc {document_id} is out of order: {e}");
                break;
            }
        }
        log.trim_to(config.history_limit);
        prune_sequences(&mut sequences, log.base_revision());

        let (writer, outcomes) = PersistenceWriter::spawn(document_id, store);
        let now = Instant::now();
        log::info!(
            "Opened doc {document_id} at revision {} (checkpoint {})",
            recovered.state.revision(),
            recovered.checkpoint_revision
        );

        Self {
            document_id,
            broadcast: BroadcastGroup::new(config.broadcast_capacity),
            config,
            state: recovered.state,
            log,
            sequences,
            commands,
            writer: Some(writer),
            outcomes,
            pending_writes: 0,
            unlogged: Vec::new(),
            saved_revision: recovered.checkpoint_revision,
            checkpoint_in_flight: false,
            last_checkpoint_at: now,
            last_version_at: now,
            last_activity: now,
            flush_waiters: Vec::new(),
        }
    }

    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.close().await;
                        let _ = reply.send(());
                        return;
                    }
                    Some(command) => {
                        self.last_activity = Instant::now();
                        self.handle(command);
                    }
                    None => {
                        self.close().await;
                        return;
                    }
                },
                Some(outcome) = self.outcomes.recv() => self.on_write_outcome(outcome),
                _ = tick.tick() => {
                    self.retry_unlogged();
                    self.maybe_checkpoint();
                    if self.is_idle() {
                        self.stop_idle().await;
                        return;
                    }
                }
            }
        }
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Submit { operation, reply } => {
                let result = self.submit(operation);
                let _ = reply.send(result);
            }
            Command::Subscribe {
                participant_id,
                known_revision,
                reply,
            } => {
                let subscription = self.subscribe(&participant_id, known_revision);
                let _ = reply.send(subscription);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.state.clone());
            }
            Command::Publish(event) => {
                self.broadcast.publish(event);
            }
            Command::Flush { reply } => self.flush(reply),
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::Shutdown { .. } => {}
        }
    }

    fn submit(&mut self, operation: Operation) -> Result<Submitted, SubmitError> {
        if let Some(seen) = self.sequences.get(&operation.client_id) {
            if let Some(previous) = seen.find(operation.seq) {
                log::debug!(
                    "Doc {}: resubmission of {} seq {} answered with revision {}",
                    self.document_id,
                    operation.client_id,
                    operation.seq,
                    previous.revision
                );
                return Ok(Submitted {
                    revision: previous.revision,
                    operation: previous.operation.clone(),
                    duplicate: true,
                });
            }
            if operation.seq <= seen.highest {
                return Err(SubmitError::Malformed(format!(
                    "sequence number {} already used",
                    operation.seq
                )));
            }
        }

        let current = self.state.revision();
        if operation.revision > current {
            return Err(SubmitError::UnknownRevision {
                revision: operation.revision,
                current,
            });
        }

        // Length of the document the client edited.
        let base_len = if operation.revision == current {
            self.state.len()
        } else {
            match self.log.get(operation.revision + 1) {
                Some(next) => next.delta().base_len(),
                None => {
                    log::debug!(
                        "Doc {}: revision {} from {} is no longer retained, resyncing",
                        self.document_id,
                        operation.revision,
                        operation.client_id
                    );
                    return Err(SubmitError::Resync(self.state.clone()));
                }
            }
        };

        let Operation {
            client_id,
            seq,
            revision,
            delta,
        } = operation;
        let delta = delta
            .pad_to(base_len)
            .map_err(|e| SubmitError::Malformed(e.to_string()))?;
        let padded = Operation::new(client_id, seq, revision, delta);

        let rebased = match self.log.rebase(&padded) {
            Ok(rebased) => rebased,
            Err(e) => {
                log::error!(
                    "Doc {}: rebase of {} seq {seq} failed: {e}",
                    self.document_id,
                    padded.client_id
                );
                return Err(SubmitError::Resync(self.state.clone()));
            }
        };
        if let Err(e) = self.state.apply(&rebased.delta) {
            log::error!("Doc {}: rebased operation does not apply: {e}", self.document_id);
            return Err(SubmitError::Resync(self.state.clone()));
        }

        let committed = Committed {
            revision: self.state.revision(),
            operation: rebased,
        };
        if let Err(e) = self.log.append(committed.clone()) {
            log::error!("Doc {}: change log out of step with document: {e}", self.document_id);
        }
        self.log.trim_to(self.config.history_limit);

        let shared = Arc::new(committed.clone());
        self.sequences
            .entry(committed.client_id().clone())
            .or_default()
            .record(Arc::clone(&shared));
        prune_sequences(&mut self.sequences, self.log.base_revision());
        self.broadcast.publish(DocumentEvent::Committed(Arc::clone(&shared)));
        log::trace!(
            "Doc {}: committed revision {} from {}",
            self.document_id,
            committed.revision,
            committed.client_id()
        );

        let revision = committed.revision;
        let operation = committed.operation.clone();
        self.queue(WriteJob::Append(vec![committed]));
        self.maybe_checkpoint();

        Ok(Submitted {
            revision,
            operation,
            duplicate: false,
        })
    }

    fn subscribe(&mut self, participant_id: &str, known_revision: Option<u64>) -> Subscription {
        let events = self.broadcast.subscribe();
        let missed = known_revision.and_then(|revision| match self.log.since(revision) {
            Ok(entries) => Some(entries.cloned().collect::<Vec<_>>()),
            Err(e) => {
                log::debug!(
                    "Doc {}: no catch-up for {participant_id} from revision {revision}: {e}",
                    self.document_id
                );
                None
            }
        });
        log::debug!(
            "Doc {}: {participant_id} subscribed at revision {}",
            self.document_id,
            self.state.revision()
        );
        Subscription {
            document_id: self.document_id,
            snapshot: self.state.clone(),
            missed,
            events,
        }
    }

    fn flush(&mut self, reply: oneshot::Sender<Result<u64, StoreError>>) {
        let target = self.state.revision();
        if target <= self.saved_revision {
            let _ = reply.send(Ok(self.saved_revision));
            return;
        }
        self.flush_waiters.push((target, reply));
        self.start_checkpoint(false);
    }

    fn stats(&self) -> DocumentStats {
        DocumentStats {
            revision: self.state.revision(),
            saved_revision: self.saved_revision,
            retained_log: self.log.len(),
            oldest_rebase_revision: self.log.base_revision(),
            tracked_clients: self.sequences.len(),
            broadcast: self.broadcast.stats(),
        }
    }

    fn queue(&mut self, job: WriteJob) {
        let Some(writer) = &self.writer else {
            log::error!("Doc {}: writer already closed", self.document_id);
            return;
        };
        if writer.submit(job) {
            self.pending_writes += 1;
        } else {
            log::error!("Doc {}: writer task is gone", self.document_id);
        }
    }

    fn is_dirty(&self) -> bool {
        self.state.revision() > self.saved_revision
    }

    fn maybe_checkpoint(&mut self) {
        if self.is_dirty()
            && !self.checkpoint_in_flight
            && self.last_checkpoint_at.elapsed() >= self.config.checkpoint_interval
        {
            self.start_checkpoint(false);
        }
    }

    /// Queue a checkpoint of the current state. Unless `force`d, at most one
    /// checkpoint is in flight.
    fn start_checkpoint(&mut self, force: bool) {
        if self.checkpoint_in_flight && !force {
            return;
        }
        let keep_version = (self.config.max_versions > 0
            && self.last_version_at.elapsed() >= self.config.version_interval)
            .then_some(self.config.max_versions);
        let checkpoint = Checkpoint::new(self.document_id, &self.state);
        self.checkpoint_in_flight = true;
        self.broadcast.publish(DocumentEvent::SaveStatus(SaveStatus::Saving));
        self.queue(WriteJob::Checkpoint {
            checkpoint,
            keep_version,
        });
    }

    fn retry_unlogged(&mut self) {
        if self.unlogged.is_empty() {
            return;
        }
        let saved = self.saved_revision;
        let entries: Vec<Committed> = std::mem::take(&mut self.unlogged)
            .into_iter()
            .filter(|c| c.revision > saved)
            .collect();
        if !entries.is_empty() {
            log::debug!("Doc {}: retrying {} log appends", self.document_id, entries.len());
            self.queue(WriteJob::Append(entries));
        }
    }

    fn on_write_outcome(&mut self, outcome: WriteOutcome) {
        self.pending_writes = self.pending_writes.saturating_sub(1);
        match outcome {
            WriteOutcome::Appended { through } => {
                log::trace!("Doc {}: log durable through {through}", self.document_id);
            }
            WriteOutcome::AppendFailed { entries, error } => {
                log::warn!(
                    "Doc {}: log append of {} entries failed: {error}",
                    self.document_id,
                    entries.len()
                );
                self.unlogged.extend(entries);
                self.unlogged.sort_by_key(|c| c.revision);
                self.unlogged.dedup_by_key(|c| c.revision);
            }
            WriteOutcome::Saved { revision, versioned } => {
                self.checkpoint_in_flight = false;
                self.saved_revision = self.saved_revision.max(revision);
                self.last_checkpoint_at = Instant::now();
                if versioned {
                    self.last_version_at = Instant::now();
                    log::debug!("Doc {}: version saved at revision {revision}", self.document_id);
                }
                log::debug!("Doc {}: checkpoint saved at revision {revision}", self.document_id);
                self.broadcast.publish(DocumentEvent::SaveStatus(SaveStatus::Saved { revision }));

                let saved = self.saved_revision;
                let (done, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.flush_waiters)
                    .into_iter()
                    .partition(|(target, _)| *target <= saved);
                for (_, reply) in done {
                    let _ = reply.send(Ok(saved));
                }
                self.flush_waiters = waiting;
                if !self.flush_waiters.is_empty() {
                    self.start_checkpoint(false);
                }
            }
            WriteOutcome::SaveFailed { revision, error } => {
                self.checkpoint_in_flight = false;
                self.last_checkpoint_at = Instant::now();
                log::warn!(
                    "Doc {}: checkpoint at revision {revision} failed: {error}",
                    self.document_id
                );
                self.broadcast.publish(DocumentEvent::SaveStatus(SaveStatus::Error {
                    message: error.to_string(),
                }));
                for (_, reply) in self.flush_waiters.drain(..) {
                    let _ = reply.send(Err(error.clone()));
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        self.broadcast.subscriber_count() == 0
            && !self.is_dirty()
            && !self.checkpoint_in_flight
            && self.pending_writes == 0
            && self.unlogged.is_empty()
            && self.flush_waiters.is_empty()
            && self.last_activity.elapsed() >= self.config.idle_timeout
    }

    async fn stop_idle(&mut self) {
        self.commands.close();
        let mut dropped = 0;
        while self.commands.try_recv().is_ok() {
            dropped += 1;
        }
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        log::info!(
            "Closed idle doc {} at revision {} ({dropped} queued commands left for retry)",
            self.document_id,
            self.state.revision()
        );
    }

    /// Persist what is outstanding and stop the writer.
    async fn close(&mut self) {
        self.commands.close();
        self.retry_unlogged();
        if self.is_dirty() {
            self.start_checkpoint(true);
        }
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        while let Ok(outcome) = self.outcomes.try_recv() {
            self.on_write_outcome(outcome);
        }
        for (_, reply) in self.flush_waiters.drain(..) {
            let _ = reply.send(Err(StoreError::Database("document closed".into())));
        }

        if self.is_dirty() {
            log::warn!(
                "Doc {} closed at revision {} with checkpoint at {}",
                self.document_id,
                self.state.revision(),
                self.saved_revision
            );
        } else {
            log::info!("Closed doc {} at revision {}", self.document_id, self.state.revision());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seen_sequences_window() {
        let mut seen = SeenSequences::default();
        for seq in 1..=(SEQUENCE_WINDOW as u64 + 5) {
            seen.record(Arc::new(Committed {
                revision: seq,
                operation: Operation::new("a", seq, seq - 1, Default::default()),
            }));
        }
        assert_eq!(seen.highest, SEQUENCE_WINDOW as u64 + 5);
        assert!(seen.find(1).is_none());
        let newest = SEQUENCE_WINDOW as u64 + 5;
        assert_eq!(seen.find(newest).map(|c| c.revision), Some(newest));
    }

    #[test]
    fn test_prune_sequences_drops_clients_behind_log() {
        let mut sequences: HashMap<ClientId, SeenSequences> = HashMap::new();
        for (revision, client) in [(1, "a"), (2, "b"), (3, "a"), (4, "c")] {
            sequences.entry(client.into()).or_default().record(Arc::new(Committed {
                revision,
                operation: Operation::new(client, revision, revision - 1, Default::default()),
            }));
        }

        prune_sequences(&mut sequences, 2);
        let mut kept: Vec<&str> = sequences.keys().map(|c| c.as_str()).collect();
        kept.sort();
        assert_eq!(kept, vec!["a", "c"]);

        prune_sequences(&mut sequences, 4);
        assert!(sequences.is_empty());
    }
}
