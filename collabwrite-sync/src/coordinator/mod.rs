//! Synchronization coordinator: one actor per open document.
//!
//! [`Coordinator`] is a cheap, cloneable handle. Document actors are
//! started lazily on first use, recovered from the [`PersistenceGateway`],
//! and stop themselves when idle. A request that races with an actor
//! stopping is retried once against a fresh actor.
//!
//! Presence (sessions, cursors, chat) lives in a shared [`SessionRegistry`]
//! and is fanned out through the document's actor so it reaches the same
//! subscribers as the commits.

mod actor;
mod writer;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use collabwrite_core::{Committed, DocumentState, Operation};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::{BroadcastStats, DocumentEvent};
use crate::protocol::ChatMessage;
use crate::session::{CursorRange, Session, SessionRegistry};
use crate::storage::{unix_now, Checkpoint, PersistenceGateway, StoreError};
use actor::Command;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Minimum time between checkpoints of a dirty document
    pub checkpoint_interval: Duration,
    /// Minimum time between recorded versions
    pub version_interval: Duration,
    /// Versions kept per document
    pub max_versions: usize,
    /// Committed operations kept in memory for rebasing and catch-up
    pub history_limit: usize,
    /// Events buffered per subscriber before it lags
    pub broadcast_capacity: usize,
    /// Commands buffered per document actor
    pub command_capacity: usize,
    /// Housekeeping period of each actor
    pub tick_interval: Duration,
    /// How long an unobserved, fully persisted document stays open
    pub idle_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(2),
            version_interval: Duration::from_secs(60),
            max_versions: 10,
            history_limit: 1000,
            broadcast_capacity: 256,
            command_capacity: 256,
            tick_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
        }
    }
}

impl CoordinatorConfig {
    /// Short intervals so tests observe checkpoints and idle shutdown quickly.
    pub fn for_testing() -> Self {
        Self {
            checkpoint_interval: Duration::from_millis(50),
            version_interval: Duration::from_millis(200),
            max_versions: 3,
            history_limit: 64,
            broadcast_capacity: 64,
            command_capacity: 64,
            tick_interval: Duration::from_millis(10),
            idle_timeout: Duration::from_millis(100),
        }
    }
}

/// A successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submitted {
    /// Revision produced by the operation
    pub revision: u64,
    /// The operation as committed (rebased onto the prior head)
    pub operation: Operation,
    /// The same `(client_id, seq)` had already been committed
    pub duplicate: bool,
}

/// Why an operation was not committed. The document is unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("malformed operation: {0}")]
    Malformed(String),
    #[error("revision {revision} is ahead of the document (at {current})")]
    UnknownRevision { revision: u64, current: u64 },
    /// The operation cannot be rebased; the client must restart from this state.
    #[error("client must resync at revision {}", .0.revision())]
    Resync(DocumentState),
    #[error("document {0} is unavailable")]
    Unavailable(Uuid),
}

/// Coordinator errors outside of submission.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    #[error("document {0} is unavailable")]
    Unavailable(Uuid),
    #[error("coordinator is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A live view of one document.
///
/// `events` starts right after `snapshot.revision()`: every commit with a
/// greater revision is delivered, in order.
#[derive(Debug)]
pub struct Subscription {
    pub document_id: Uuid,
    pub snapshot: DocumentState,
    /// Commits after the requested known revision, when still retained
    pub missed: Option<Vec<Committed>>,
    pub events: broadcast::Receiver<DocumentEvent>,
}

/// Point-in-time figures for one open document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentStats {
    pub revision: u64,
    pub saved_revision: u64,
    pub retained_log: usize,
    pub oldest_rebase_revision: u64,
    /// Clients with commits still inside the retained log
    pub tracked_clients: usize,
    pub broadcast: BroadcastStats,
}

struct Inner {
    config: CoordinatorConfig,
    store: Arc<dyn PersistenceGateway>,
    documents: Mutex<HashMap<Uuid, mpsc::Sender<Command>>>,
    sessions: RwLock<SessionRegistry>,
    closing: AtomicBool,
}

/// Handle to the synchronization coordinator.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, store: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                documents: Mutex::new(HashMap::new()),
                sessions: RwLock::new(SessionRegistry::new()),
                closing: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.inner.store
    }

    /// Commit an operation, rebasing it over anything the client missed.
    ///
    /// Subscribers (including the submitter's own subscription) receive the
    /// commit as a [`DocumentEvent::Committed`].
    pub async fn submit(
        &self,
        document_id: Uuid,
        operation: Operation,
    ) -> Result<Submitted, SubmitError> {
        let result = self
            .request(document_id, |reply| Command::Submit {
                operation: operation.clone(),
                reply,
            })
            .await;
        match result {
            Ok(result) => result,
            Err(_) => Err(SubmitError::Unavailable(document_id)),
        }
    }

    /// Open a live view of a document.
    ///
    /// With `known_revision`, the subscription also carries the commits made
    /// since then, if they are still retained.
    pub async fn subscribe(
        &self,
        document_id: Uuid,
        participant_id: &str,
        known_revision: Option<u64>,
    ) -> Result<Subscription, CoordinatorError> {
        self.request(document_id, |reply| Command::Subscribe {
            participant_id: participant_id.to_string(),
            known_revision,
            reply,
        })
        .await
    }

    /// Current content and revision.
    pub async fn snapshot(&self, document_id: Uuid) -> Result<DocumentState, CoordinatorError> {
        self.request(document_id, |reply| Command::Snapshot { reply }).await
    }

    /// Checkpoint the document now. Resolves with the saved revision, which
    /// covers every commit made before the call.
    pub async fn flush(&self, document_id: Uuid) -> Result<u64, CoordinatorError> {
        Ok(self.request(document_id, |reply| Command::Flush { reply }).await??)
    }

    pub async fn document_stats(
        &self,
        document_id: Uuid,
    ) -> Result<DocumentStats, CoordinatorError> {
        self.request(document_id, |reply| Command::Stats { reply }).await
    }

    /// Stored versions, newest first.
    pub async fn versions(&self, document_id: Uuid) -> Result<Vec<Checkpoint>, CoordinatorError> {
        let store = Arc::clone(&self.inner.store);
        tokio::task::spawn_blocking(move || store.list_versions(document_id))
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map_err(CoordinatorError::from)
    }

    /// Register a participant and announce them. Returns their color.
    pub async fn join(
        &self,
        document_id: Uuid,
        participant_id: &str,
        display_name: &str,
    ) -> String {
        let (color, session) = {
            let mut sessions = self.inner.sessions.write().await;
            let color = sessions.join(document_id, participant_id, display_name);
            (color, sessions.get(document_id, participant_id).cloned())
        };
        if let Some(session) = session {
            self.publish(document_id, DocumentEvent::SessionJoined(session)).await;
        }
        color
    }

    /// Remove a participant and announce it.
    pub async fn leave(&self, document_id: Uuid, participant_id: &str) -> Option<Session> {
        let removed = self.inner.sessions.write().await.leave(document_id, participant_id);
        if removed.is_some() {
            self.publish(
                document_id,
                DocumentEvent::SessionLeft {
                    participant_id: participant_id.to_string(),
                },
            )
            .await;
        }
        removed
    }

    pub async fn list_active(&self, document_id: Uuid) -> Vec<Session> {
        self.inner.sessions.read().await.list_active(document_id)
    }

    pub async fn participant_count(&self, document_id: Uuid) -> usize {
        self.inner.sessions.read().await.participant_count(document_id)
    }

    /// Record and announce a cursor move. Unknown sessions are ignored.
    pub async fn update_cursor(
        &self,
        document_id: Uuid,
        participant_id: &str,
        range: CursorRange,
    ) -> bool {
        let updated = self
            .inner
            .sessions
            .write()
            .await
            .update_cursor(document_id, participant_id, range);
        if updated {
            self.publish(
                document_id,
                DocumentEvent::CursorMoved {
                    participant_id: participant_id.to_string(),
                    range,
                },
            )
            .await;
        }
        updated
    }

    /// Relay a chat line from a joined participant.
    pub async fn send_chat(
        &self,
        document_id: Uuid,
        participant_id: &str,
        text: &str,
    ) -> Option<ChatMessage> {
        let display_name = self
            .inner
            .sessions
            .read()
            .await
            .get(document_id, participant_id)?
            .display_name
            .clone();
        let message = ChatMessage {
            participant_id: participant_id.to_string(),
            display_name,
            text: text.to_string(),
            sent_at: unix_now(),
        };
        self.publish(document_id, DocumentEvent::Chat(message.clone())).await;
        Some(message)
    }

    /// Documents with a running actor.
    pub async fn open_documents(&self) -> usize {
        self.inner
            .documents
            .lock()
            .await
            .values()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Stop every actor after persisting outstanding work.
    pub async fn shutdown(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let senders: Vec<_> = self.inner.documents.lock().await.drain().collect();
        let count = senders.len();
        for (document_id, tx) in senders {
            let (reply, done) = oneshot::channel();
            if tx.send(Command::Shutdown { reply }).await.is_ok() && done.await.is_ok() {
                continue;
            }
            log::debug!("Doc {document_id} was already closed");
        }
        log::info!("Coordinator shut down ({count} documents)");
    }

    /// Hand a presence event to the document's actor, if it is running.
    async fn publish(&self, document_id: Uuid, event: DocumentEvent) {
        let tx = self.inner.documents.lock().await.get(&document_id).cloned();
        let Some(tx) = tx else {
            return;
        };
        if let Err(e) = tx.try_send(Command::Publish(event)) {
            log::debug!("Presence event for doc {document_id} dropped: {e}");
        }
    }

    async fn handle(&self, document_id: Uuid) -> Result<mpsc::Sender<Command>, CoordinatorError> {
        if self.inner.closing.load(Ordering::SeqCst) {
            return Err(CoordinatorError::ShuttingDown);
        }
        let mut documents = self.inner.documents.lock().await;
        if let Some(tx) = documents.get(&document_id) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }
        let tx = actor::spawn(
            document_id,
            self.inner.config.clone(),
            Arc::clone(&self.inner.store),
        );
        documents.insert(document_id, tx.clone());
        Ok(tx)
    }

    async fn forget(&self, document_id: Uuid, stale: &mpsc::Sender<Command>) {
        let mut documents = self.inner.documents.lock().await;
        if documents
            .get(&document_id)
            .is_some_and(|current| current.same_channel(stale))
        {
            documents.remove(&document_id);
        }
    }

    /// Send a command and wait for its reply, respawning the actor once if
    /// it stopped before answering.
    async fn request<T>(
        &self,
        document_id: Uuid,
        make: impl Fn(oneshot::Sender<T>) -> Command,
    ) -> Result<T, CoordinatorError> {
        for attempt in 0..2 {
            let tx = self.handle(document_id).await?;
            let (reply, response) = oneshot::channel();
            if tx.send(make(reply)).await.is_ok() {
                if let Ok(value) = response.await {
                    return Ok(value);
                }
            }
            log::debug!("Actor for doc {document_id} went away (attempt {attempt})");
            self.forget(document_id, &tx).await;
        }
        Err(CoordinatorError::Unavailable(document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientDocument;
    use crate::protocol::SaveStatus;
    use crate::storage::MemoryStore;
    use collabwrite_core::{Component, Delta};
    use tokio::time::{sleep, timeout};

    fn coordinator() -> (Coordinator, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Coordinator::new(CoordinatorConfig::for_testing(), store.clone()), store)
    }

    #[tokio::test]
    async fn test_submit_assigns_sequential_revisions() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();

        let first = coordinator
            .submit(doc, Operation::new("alice", 1, 0, Delta::new().insert("ab")))
            .await
            .unwrap();
        let second = coordinator
            .submit(doc, Operation::new("alice", 2, 1, Delta::new().retain(2).insert("c")))
            .await
            .unwrap();

        assert_eq!((first.revision, second.revision), (1, 2));
        assert_eq!(coordinator.snapshot(doc).await.unwrap().text(), "abc");
    }

    #[tokio::test]
    async fn test_concurrent_submissions_are_rebased() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("seed", 1, 0, Delta::new().insert("ac")))
            .await
            .unwrap();

        // Both computed against revision 1.
        coordinator
            .submit(doc, Operation::new("bob", 1, 1, Delta::new().retain(1).insert("B")))
            .await
            .unwrap();
        let rebased = coordinator
            .submit(doc, Operation::new("alice", 1, 1, Delta::new().retain(1).insert("A")))
            .await
            .unwrap();

        // alice < bob, so alice's insert lands first at the shared position.
        assert_eq!(rebased.operation.revision, 2);
        assert_eq!(coordinator.snapshot(doc).await.unwrap().text(), "aABc");
    }

    #[tokio::test]
    async fn test_stale_delete_rebased_past_insert() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        for (seq, ch) in (1..=5).zip(["a", "b", "c", "d", "e"]) {
            let delta = Delta::new().retain(seq as usize - 1).insert(ch);
            coordinator
                .submit(doc, Operation::new("seed", seq, seq - 1, delta))
                .await
                .unwrap();
        }
        let base = coordinator.snapshot(doc).await.unwrap();
        assert_eq!((base.revision(), base.text().as_str()), (5, "abcde"));

        let mut ann = ClientDocument::from_snapshot("ann", 5, base.content().clone());
        let mut ben = ClientDocument::from_snapshot("ben", 5, base.content().clone());
        let insert = ann.apply_local(Delta::new().insert("x")).unwrap().unwrap();
        let delete = ben.apply_local(Delta::new().delete(1)).unwrap().unwrap();

        let first = coordinator.submit(doc, insert).await.unwrap();
        let second = coordinator.submit(doc, delete).await.unwrap();
        assert_eq!((first.revision, second.revision), (6, 7));
        // The delete moved past the insert that landed before it.
        assert_eq!(second.operation.delta.components()[0], Component::retain(1));
        assert_eq!(second.operation.delta.base_len(), 6);

        for committed in [&first, &second] {
            ann.apply_remote(committed.revision, &committed.operation).unwrap();
            ben.apply_remote(committed.revision, &committed.operation).unwrap();
        }
        let head = coordinator.snapshot(doc).await.unwrap();
        assert_eq!(head.text(), "xbcde");
        assert_eq!(ann.text(), head.text());
        assert_eq!(ben.text(), head.text());
        assert!(!ann.has_pending() && !ben.has_pending());
    }

    #[tokio::test]
    async fn test_short_delta_is_padded() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("hello")))
            .await
            .unwrap();
        // Editor-style delta without the trailing retain.
        coordinator
            .submit(doc, Operation::new("a", 2, 1, Delta::new().insert(">")))
            .await
            .unwrap();
        assert_eq!(coordinator.snapshot(doc).await.unwrap().text(), ">hello");
    }

    #[tokio::test]
    async fn test_rejections_leave_document_unchanged() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("abc")))
            .await
            .unwrap();

        let too_long = coordinator
            .submit(doc, Operation::new("a", 2, 1, Delta::new().retain(5).insert("x")))
            .await;
        assert!(matches!(too_long, Err(SubmitError::Malformed(_))));

        let future = coordinator
            .submit(doc, Operation::new("a", 3, 9, Delta::new().insert("x")))
            .await;
        assert_eq!(future, Err(SubmitError::UnknownRevision { revision: 9, current: 1 }));

        let snapshot = coordinator.snapshot(doc).await.unwrap();
        assert_eq!((snapshot.revision(), snapshot.text()), (1, "abc".to_string()));
    }

    #[tokio::test]
    async fn test_resubmission_returns_original_commit() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        let op = Operation::new("a", 7, 0, Delta::new().insert("x"));

        let first = coordinator.submit(doc, op.clone()).await.unwrap();
        let again = coordinator.submit(doc, op).await.unwrap();

        assert!(!first.duplicate);
        assert!(again.duplicate);
        assert_eq!(again.revision, first.revision);
        assert_eq!(coordinator.snapshot(doc).await.unwrap().text(), "x");

        let reused = coordinator
            .submit(doc, Operation::new("a", 3, 1, Delta::new().insert("y")))
            .await;
        assert!(matches!(reused, Err(SubmitError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_trimmed_history_requires_resync() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            history_limit: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coordinator = Coordinator::new(config, store);
        let doc = Uuid::new_v4();
        for seq in 1..=4 {
            coordinator
                .submit(doc, Operation::new("a", seq, seq - 1, Delta::new().insert("x")))
                .await
                .unwrap();
        }

        let stale = coordinator
            .submit(doc, Operation::new("b", 1, 0, Delta::new().insert("y")))
            .await;
        match stale {
            Err(SubmitError::Resync(state)) => assert_eq!(state.revision(), 4),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clients_behind_history_are_forgotten() {
        let store = Arc::new(MemoryStore::new());
        let config = CoordinatorConfig {
            history_limit: 2,
            ..CoordinatorConfig::for_testing()
        };
        let coordinator = Coordinator::new(config, store);
        let doc = Uuid::new_v4();
        let first = Operation::new("c1", 1, 0, Delta::new().insert("x"));
        coordinator.submit(doc, first.clone()).await.unwrap();
        for revision in 1..5u64 {
            let client = format!("c{}", revision + 1);
            coordinator
                .submit(doc, Operation::new(client, 1, revision, Delta::new().insert("x")))
                .await
                .unwrap();
        }

        let stats = coordinator.document_stats(doc).await.unwrap();
        assert_eq!(stats.oldest_rebase_revision, 3);
        assert_eq!(stats.tracked_clients, 2);

        // c1's commit fell out of the log, so its resubmission is stale.
        match coordinator.submit(doc, first).await {
            Err(SubmitError::Resync(state)) => assert_eq!(state.revision(), 5),
            other => panic!("expected resync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscription_receives_commits_in_order() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        let mut sub = coordinator.subscribe(doc, "viewer", None).await.unwrap();
        assert_eq!(sub.snapshot.revision(), 0);
        assert!(sub.missed.is_none());

        for seq in 1..=3 {
            coordinator
                .submit(doc, Operation::new("w", seq, seq - 1, Delta::new().insert("x")))
                .await
                .unwrap();
        }

        let mut revisions = Vec::new();
        while revisions.len() < 3 {
            match timeout(Duration::from_secs(2), sub.events.recv()).await.unwrap().unwrap() {
                DocumentEvent::Committed(c) => revisions.push(c.revision),
                _ => {}
            }
        }
        assert_eq!(revisions, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_subscribe_with_known_revision_returns_missed() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        for seq in 1..=3 {
            coordinator
                .submit(doc, Operation::new("w", seq, seq - 1, Delta::new().insert("x")))
                .await
                .unwrap();
        }

        let sub = coordinator.subscribe(doc, "late", Some(1)).await.unwrap();
        let missed = sub.missed.unwrap();
        assert_eq!(missed.iter().map(|c| c.revision).collect::<Vec<_>>(), vec![2, 3]);

        let ahead = coordinator.subscribe(doc, "lost", Some(10)).await.unwrap();
        assert!(ahead.missed.is_none());
    }

    #[tokio::test]
    async fn test_flush_persists_checkpoint() {
        let (coordinator, store) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("saved")))
            .await
            .unwrap();

        assert_eq!(coordinator.flush(doc).await.unwrap(), 1);
        let checkpoint = store.load_latest(doc).unwrap().unwrap();
        assert_eq!(checkpoint.content.to_text(), "saved");
        // Nothing new, resolves immediately.
        assert_eq!(coordinator.flush(doc).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_reported_and_retried() {
        let (coordinator, store) = coordinator();
        let doc = Uuid::new_v4();
        let mut sub = coordinator.subscribe(doc, "viewer", None).await.unwrap();
        store.fail_saves(true);

        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("x")))
            .await
            .unwrap();
        assert!(coordinator.flush(doc).await.is_err());

        // Editing continues while saves fail.
        coordinator
            .submit(doc, Operation::new("a", 2, 1, Delta::new().retain(1).insert("y")))
            .await
            .unwrap();

        store.fail_saves(false);
        let saved = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(DocumentEvent::SaveStatus(SaveStatus::Saved { revision })) =
                    sub.events.recv().await
                {
                    return revision;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(saved, 2);
        assert!(store.failed_save_count() >= 1);
    }

    #[tokio::test]
    async fn test_idle_actor_stops_and_restarts() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("kept")))
            .await
            .unwrap();
        assert_eq!(coordinator.open_documents().await, 1);

        // Checkpoint, then idle timeout.
        timeout(Duration::from_secs(3), async {
            while coordinator.open_documents().await > 0 {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        // A new actor recovers from storage.
        let snapshot = coordinator.snapshot(doc).await.unwrap();
        assert_eq!((snapshot.revision(), snapshot.text()), (1, "kept".to_string()));
    }

    #[tokio::test]
    async fn test_presence_events() {
        let (coordinator, _) = coordinator();
        let doc = Uuid::new_v4();
        let mut sub = coordinator.subscribe(doc, "p1", None).await.unwrap();

        assert_eq!(coordinator.join(doc, "p2", "Bob").await, "#6BCB77");
        assert!(coordinator.update_cursor(doc, "p2", CursorRange::caret(0)).await);
        let chat = coordinator.send_chat(doc, "p2", "hi").await.unwrap();
        assert_eq!(chat.display_name, "Bob");
        assert!(coordinator.send_chat(doc, "ghost", "hi").await.is_none());
        coordinator.leave(doc, "p2").await;

        let mut kinds = Vec::new();
        while kinds.len() < 4 {
            let event = timeout(Duration::from_secs(2), sub.events.recv()).await.unwrap().unwrap();
            kinds.push(match event {
                DocumentEvent::SessionJoined(s) => format!("joined:{}", s.participant_id),
                DocumentEvent::CursorMoved { participant_id, .. } => {
                    format!("cursor:{participant_id}")
                }
                DocumentEvent::Chat(m) => format!("chat:{}", m.text),
                DocumentEvent::SessionLeft { participant_id } => format!("left:{participant_id}"),
                other => format!("{other:?}"),
            });
        }
        assert_eq!(kinds, vec!["joined:p2", "cursor:p2", "chat:hi", "left:p2"]);
        assert!(coordinator.list_active(doc).await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_refuses_work() {
        let (coordinator, store) = coordinator();
        let doc = Uuid::new_v4();
        coordinator
            .submit(doc, Operation::new("a", 1, 0, Delta::new().insert("bye")))
            .await
            .unwrap();

        coordinator.shutdown().await;
        assert_eq!(store.load_latest(doc).unwrap().unwrap().revision, 1);
        assert_eq!(coordinator.snapshot(doc).await, Err(CoordinatorError::ShuttingDown));
        assert!(matches!(
            coordinator.submit(doc, Operation::new("a", 2, 1, Delta::new())).await,
            Err(SubmitError::Unavailable(_))
        ));
    }
}
