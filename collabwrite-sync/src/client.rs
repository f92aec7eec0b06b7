//! Editor-side synchronization.
//!
//! [`ClientDocument`] is the pure state machine every editor runs:
//!
//! ```text
//!                 local edit                  local edit
//! Synchronized ──────────────► AwaitingConfirm ──────────► AwaitingWithBuffer
//!      ▲                            │    ▲                        │
//!      └──────── ack ───────────────┘    └──── ack (send buffer) ─┘
//! ```
//!
//! One operation is in flight at a time; edits made meanwhile are composed
//! into a buffer. Remote operations are transformed against both, so local
//! state never waits on the network.
//!
//! [`SyncClient`] drives a `ClientDocument` over a WebSocket connection and
//! resumes after reconnecting from the last revision it saw.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use collabwrite_core::{transform_deltas, ClientId, Committed, Delta, Operation, OtError};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::protocol::{
    ChatMessage, ClientMessage, ProtocolError, RejectReason, SaveStatus, ServerMessage,
};
use crate::session::{CursorRange, Session};
use crate::storage::Checkpoint;

/// Client errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error("expected revision {expected}, received {actual}")]
    Gap { expected: u64, actual: u64 },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Where the client is in the submit / acknowledge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Synchronized,
    AwaitingConfirm,
    AwaitingWithBuffer,
}

/// What a remote operation did to the local document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// Apply this (transformed) delta to the editor.
    Applied(Delta),
    /// It was our in-flight operation. Send the returned one next, if any.
    Acknowledged(Option<Operation>),
    /// Already seen.
    Ignored,
}

/// Result of reconciling with the server after a (re)join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Caught up from the missed operations. Pending edits survive; the
    /// in-flight one must be sent again.
    Resumed { resend: Option<Operation> },
    /// Replaced with the server snapshot.
    Reset { discarded_local: bool },
}

/// Local replica of one document.
#[derive(Debug, Clone)]
pub struct ClientDocument {
    client_id: ClientId,
    /// Local content, including unacknowledged edits
    content: Delta,
    /// Last server revision reflected in `content`
    revision: u64,
    inflight: Option<Operation>,
    buffer: Option<Delta>,
    next_seq: u64,
}

impl ClientDocument {
    /// Empty document at revision 0.
    pub fn new(client_id: impl Into<ClientId>) -> Self {
        Self::from_snapshot(client_id, 0, Delta::new())
    }

    pub fn from_snapshot(client_id: impl Into<ClientId>, revision: u64, content: Delta) -> Self {
        Self {
            client_id: client_id.into(),
            content,
            revision,
            inflight: None,
            buffer: None,
            next_seq: 1,
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn content(&self) -> &Delta {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.to_text()
    }

    pub fn len(&self) -> usize {
        self.content.target_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> ClientState {
        match (&self.inflight, &self.buffer) {
            (None, _) => ClientState::Synchronized,
            (Some(_), None) => ClientState::AwaitingConfirm,
            (Some(_), Some(_)) => ClientState::AwaitingWithBuffer,
        }
    }

    pub fn inflight(&self) -> Option<&Operation> {
        self.inflight.as_ref()
    }

    /// Whether any local edit has not been acknowledged.
    pub fn has_pending(&self) -> bool {
        self.inflight.is_some()
    }

    /// Apply a local edit. Returns the operation to submit, if the client
    /// was synchronized; otherwise the edit is buffered.
    pub fn apply_local(&mut self, delta: Delta) -> Result<Option<Operation>, ClientError> {
        let delta = delta.pad_to(self.len())?;
        let content = self.content.compose(&delta)?;

        if self.inflight.is_none() {
            self.content = content;
            let operation = self.take_seq(delta);
            self.inflight = Some(operation.clone());
            return Ok(Some(operation));
        }

        let buffer = match &self.buffer {
            Some(buffer) => buffer.compose(&delta)?,
            None => delta,
        };
        self.content = content;
        self.buffer = Some(buffer);
        Ok(None)
    }

    /// Integrate an operation committed by the server.
    pub fn apply_remote(
        &mut self,
        revision: u64,
        operation: &Operation,
    ) -> Result<RemoteOutcome, ClientError> {
        if revision <= self.revision {
            return Ok(RemoteOutcome::Ignored);
        }
        if revision != self.revision + 1 {
            return Err(ClientError::Gap {
                expected: self.revision + 1,
                actual: revision,
            });
        }

        if operation.client_id == self.client_id {
            if self.inflight.as_ref().is_some_and(|op| op.seq == operation.seq) {
                return self.acknowledge(operation.seq, revision).map(RemoteOutcome::Acknowledged);
            }
            log::warn!(
                "Commit {revision} from {} is not the in-flight operation",
                self.client_id
            );
            self.revision = revision;
            return Ok(RemoteOutcome::Ignored);
        }

        let local_first = self.client_id < operation.client_id;
        let mut remote = operation.delta.clone();
        let inflight = match &self.inflight {
            Some(inflight) => {
                let (local, transformed) = transform_deltas(&inflight.delta, &remote, local_first)?;
                remote = transformed;
                Some(local)
            }
            None => None,
        };
        let buffer = match &self.buffer {
            Some(buffer) => {
                let (local, transformed) = transform_deltas(buffer, &remote, local_first)?;
                remote = transformed;
                Some(local)
            }
            None => None,
        };
        let content = self.content.compose(&remote)?;

        self.content = content;
        self.revision = revision;
        if let (Some(op), Some(delta)) = (self.inflight.as_mut(), inflight) {
            op.delta = delta;
        }
        self.buffer = buffer;
        Ok(RemoteOutcome::Applied(remote))
    }

    /// The in-flight operation was committed at `revision`. Returns the
    /// buffered edits as the next operation to submit.
    pub fn acknowledge(
        &mut self,
        seq: u64,
        revision: u64,
    ) -> Result<Option<Operation>, ClientError> {
        match &self.inflight {
            Some(op) if op.seq == seq => {}
            _ => {
                log::debug!("Ignoring stale ack for seq {seq}");
                return Ok(None);
            }
        }
        if revision != self.revision + 1 {
            return Err(ClientError::Gap {
                expected: self.revision + 1,
                actual: revision,
            });
        }

        self.revision = revision;
        self.inflight = None;
        match self.buffer.take() {
            Some(buffer) => {
                let operation = self.take_seq(buffer);
                self.inflight = Some(operation.clone());
                Ok(Some(operation))
            }
            None => Ok(None),
        }
    }

    /// Replace everything with a server snapshot. Returns whether
    /// unacknowledged local edits were thrown away.
    pub fn reset(&mut self, revision: u64, content: Delta) -> bool {
        let discarded = self.has_pending();
        if discarded {
            log::warn!(
                "Discarding unacknowledged edits of {} at revision {revision}",
                self.client_id
            );
        }
        self.content = content;
        self.revision = revision;
        self.inflight = None;
        self.buffer = None;
        discarded
    }

    /// Reconcile with the server state received on join.
    pub fn on_joined(
        &mut self,
        revision: u64,
        content: Delta,
        missed: Option<Vec<Committed>>,
    ) -> Result<JoinOutcome, ClientError> {
        let Some(missed) = missed else {
            let discarded_local = self.reset(revision, content);
            return Ok(JoinOutcome::Reset { discarded_local });
        };

        let mut replica = self.clone();
        for committed in &missed {
            replica.apply_remote(committed.revision, &committed.operation)?;
        }
        if replica.revision != revision {
            let discarded_local = self.reset(revision, content);
            return Ok(JoinOutcome::Reset { discarded_local });
        }

        *self = replica;
        let current = self.revision;
        let resend = self.inflight.as_mut().map(|op| {
            // Now expressed against the current head.
            op.revision = current;
            op.clone()
        });
        Ok(JoinOutcome::Resumed { resend })
    }

    fn take_seq(&mut self, delta: Delta) -> Operation {
        let operation = Operation::new(self.client_id.clone(), self.next_seq, self.revision, delta);
        self.next_seq += 1;
        operation
    }
}

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    Joined {
        revision: u64,
        color: String,
        participants: Vec<Session>,
    },
    /// Local state was replaced by the server's
    Reset { revision: u64, discarded_local: bool },
    /// A remote edit, already transformed for the local document
    RemoteChange { revision: u64, client_id: ClientId, delta: Delta },
    Acknowledged { seq: u64, revision: u64 },
    Rejected { seq: u64, reason: RejectReason },
    SessionJoined(Session),
    SessionLeft(String),
    CursorMoved { participant_id: String, range: CursorRange },
    Chat(ChatMessage),
    SaveStatus(SaveStatus),
    Versions(Vec<Checkpoint>),
    Error(String),
}

/// Shared between the client handle and its reader task.
struct Shared {
    participant_id: String,
    display_name: String,
    document_id: Uuid,
    document: Mutex<ClientDocument>,
    state: RwLock<ConnectionState>,
    joined: AtomicBool,
}

impl Shared {
    async fn join_message(&self) -> ClientMessage {
        let document = self.document.lock().await;
        let resume = self.joined.load(Ordering::SeqCst) || document.has_pending();
        ClientMessage::Join {
            document_id: self.document_id,
            participant_id: self.participant_id.clone(),
            display_name: self.display_name.clone(),
            known_revision: resume.then_some(document.revision()),
        }
    }
}

/// The sync client.
///
/// Edits are applied locally at once. While disconnected they stay
/// pending and are submitted after the next successful join.
pub struct SyncClient {
    shared: Arc<Shared>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    /// Asks the writer task to close the socket
    close_tx: Option<oneshot::Sender<()>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
    server_url: String,
}

impl SyncClient {
    /// `participant_id` identifies this editing session; it doubles as the
    /// operation origin.
    pub fn new(
        participant_id: impl Into<String>,
        display_name: impl Into<String>,
        document_id: Uuid,
        server_url: impl Into<String>,
    ) -> Self {
        let participant_id = participant_id.into();
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            shared: Arc::new(Shared {
                document: Mutex::new(ClientDocument::new(participant_id.clone())),
                participant_id,
                display_name: display_name.into(),
                document_id,
                state: RwLock::new(ConnectionState::Disconnected),
                joined: AtomicBool::new(false),
            }),
            outgoing_tx: None,
            close_tx: None,
            event_rx: Some(event_rx),
            event_tx,
            server_url: server_url.into(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the document, resuming from the last known
    /// revision when there is one.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.shared.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", self.server_url);
                *self.shared.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    data = out_rx.recv() => {
                        let Some(data) = data else { break };
                        if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                            break;
                        }
                    }
                    _ = &mut close_rx => break,
                }
            }
            let _ = ws_writer.close().await;
        });
        self.close_tx = Some(close_tx);

        let join = self.shared.join_message().await.encode()?;
        out_tx
            .send(join)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        self.outgoing_tx = Some(out_tx.clone());

        *self.shared.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Reader task: process incoming WebSocket messages
        let shared = Arc::clone(&self.shared);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match ServerMessage::decode(&data) {
                        Ok(server_msg) => {
                            if let Err(e) =
                                handle_server_message(&shared, &out_tx, &event_tx, server_msg).await
                            {
                                log::warn!("Sync error for {}: {e}", shared.participant_id);
                                let _ = event_tx.send(SyncEvent::Error(e.to_string())).await;
                            }
                        }
                        Err(e) => log::warn!("Undecodable server message: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *shared.state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. Pending edits are kept for the next connect.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(());
        }
        *self.shared.state.write().await = ConnectionState::Disconnected;
    }

    /// Apply a local edit and submit it when possible.
    pub async fn edit(&self, delta: Delta) -> Result<(), ClientError> {
        let operation = self.shared.document.lock().await.apply_local(delta)?;
        if let Some(operation) = operation {
            if self.connection_state().await == ConnectionState::Connected {
                self.send(&submit_message(operation)).await?;
            }
        }
        Ok(())
    }

    /// Share the local cursor. Dropped silently while offline.
    pub async fn move_cursor(&self, range: CursorRange) -> Result<(), ClientError> {
        if self.connection_state().await != ConnectionState::Connected {
            return Ok(());
        }
        self.send(&ClientMessage::Cursor { range }).await
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<(), ClientError> {
        self.send(&ClientMessage::Chat { text: text.into() }).await
    }

    /// Ask for the stored versions; they arrive as [`SyncEvent::Versions`].
    pub async fn request_versions(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::ListVersions).await
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        self.send(&ClientMessage::Ping).await
    }

    async fn send(&self, msg: &ClientMessage) -> Result<(), ClientError> {
        let encoded = msg.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed.into()),
            None => Err(ProtocolError::ConnectionClosed.into()),
        }
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Current local text.
    pub async fn text(&self) -> String {
        self.shared.document.lock().await.text()
    }

    pub async fn revision(&self) -> u64 {
        self.shared.document.lock().await.revision()
    }

    pub async fn client_state(&self) -> ClientState {
        self.shared.document.lock().await.state()
    }

    pub fn participant_id(&self) -> &str {
        &self.shared.participant_id
    }

    pub fn document_id(&self) -> Uuid {
        self.shared.document_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn submit_message(operation: Operation) -> ClientMessage {
    ClientMessage::Submit {
        seq: operation.seq,
        revision: operation.revision,
        delta: operation.delta,
    }
}

async fn send_to(out_tx: &mpsc::Sender<Vec<u8>>, msg: &ClientMessage) -> Result<(), ClientError> {
    out_tx
        .send(msg.encode()?)
        .await
        .map_err(|_| ProtocolError::ConnectionClosed.into())
}

async fn handle_server_message(
    shared: &Shared,
    out_tx: &mpsc::Sender<Vec<u8>>,
    event_tx: &mpsc::Sender<SyncEvent>,
    msg: ServerMessage,
) -> Result<(), ClientError> {
    let event = match msg {
        ServerMessage::Joined {
            revision,
            content,
            color,
            participants,
            missed,
            ..
        } => {
            let outcome = shared.document.lock().await.on_joined(revision, content, missed)?;
            shared.joined.store(true, Ordering::SeqCst);
            let _ = event_tx
                .send(SyncEvent::Joined {
                    revision,
                    color,
                    participants,
                })
                .await;
            match outcome {
                JoinOutcome::Resumed { resend } => {
                    if let Some(operation) = resend {
                        log::info!("Resubmitting seq {} after rejoin", operation.seq);
                        send_to(out_tx, &submit_message(operation)).await?;
                    }
                    None
                }
                JoinOutcome::Reset { discarded_local } => Some(SyncEvent::Reset {
                    revision,
                    discarded_local,
                }),
            }
        }

        ServerMessage::Ack { seq, revision } => {
            let next = shared.document.lock().await.acknowledge(seq, revision);
            match next {
                Ok(next) => {
                    if let Some(operation) = next {
                        send_to(out_tx, &submit_message(operation)).await?;
                    }
                    Some(SyncEvent::Acknowledged { seq, revision })
                }
                Err(ClientError::Gap { .. }) => {
                    send_to(out_tx, &shared.join_message().await).await?;
                    None
                }
                Err(e) => return Err(e),
            }
        }

        ServerMessage::Remote { revision, operation } => {
            let outcome = shared.document.lock().await.apply_remote(revision, &operation);
            match outcome {
                Ok(RemoteOutcome::Applied(delta)) => Some(SyncEvent::RemoteChange {
                    revision,
                    client_id: operation.client_id,
                    delta,
                }),
                Ok(RemoteOutcome::Acknowledged(next)) => {
                    if let Some(next) = next {
                        send_to(out_tx, &submit_message(next)).await?;
                    }
                    Some(SyncEvent::Acknowledged {
                        seq: operation.seq,
                        revision,
                    })
                }
                Ok(RemoteOutcome::Ignored) => None,
                Err(ClientError::Gap { expected, actual }) => {
                    log::warn!("Missed revisions {expected}..{actual}, rejoining");
                    send_to(out_tx, &shared.join_message().await).await?;
                    None
                }
                Err(e) => return Err(e),
            }
        }

        ServerMessage::Rejected { seq, reason } => {
            // The local replica holds an edit the server refused.
            shared.joined.store(false, Ordering::SeqCst);
            let rejoin = {
                let mut document = shared.document.lock().await;
                let revision = document.revision();
                let content = document.content().clone();
                document.reset(revision, content);
                ClientMessage::Join {
                    document_id: shared.document_id,
                    participant_id: shared.participant_id.clone(),
                    display_name: shared.display_name.clone(),
                    known_revision: None,
                }
            };
            send_to(out_tx, &rejoin).await?;
            Some(SyncEvent::Rejected { seq, reason })
        }

        ServerMessage::Resync { revision, content } => {
            let discarded_local = shared.document.lock().await.reset(revision, content);
            Some(SyncEvent::Reset {
                revision,
                discarded_local,
            })
        }

        ServerMessage::SessionJoined { session } => Some(SyncEvent::SessionJoined(session)),
        ServerMessage::SessionLeft { participant_id } => {
            Some(SyncEvent::SessionLeft(participant_id))
        }
        ServerMessage::CursorMoved { participant_id, range } => {
            Some(SyncEvent::CursorMoved { participant_id, range })
        }
        ServerMessage::Chat(message) => Some(SyncEvent::Chat(message)),
        ServerMessage::SaveStatus(status) => Some(SyncEvent::SaveStatus(status)),
        ServerMessage::Versions { versions } => Some(SyncEvent::Versions(versions)),
        ServerMessage::Pong => None,
        ServerMessage::Error { message } => Some(SyncEvent::Error(message)),
    };

    if let Some(event) = event {
        let _ = event_tx.send(event).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use collabwrite_core::{ChangeLog, DocumentState};

    /// Minimal authoritative side: rebase, apply, log.
    struct Server {
        state: DocumentState,
        log: ChangeLog,
    }

    impl Server {
        fn new(text: &str) -> Self {
            Self {
                state: DocumentState::from_text(text),
                log: ChangeLog::new(0),
            }
        }

        fn receive(&mut self, operation: &Operation) -> Committed {
            let padded = Operation {
                delta: operation
                    .delta
                    .clone()
                    .pad_to(match self.log.get(operation.revision + 1) {
                        Some(next) => next.delta().base_len(),
                        None => self.state.len(),
                    })
                    .unwrap(),
                ..operation.clone()
            };
            let rebased = self.log.rebase(&padded).unwrap();
            self.state.apply(&rebased.delta).unwrap();
            let committed = Committed {
                revision: self.state.revision(),
                operation: rebased,
            };
            self.log.append(committed.clone()).unwrap();
            committed
        }
    }

    fn deliver(client: &mut ClientDocument, committed: &Committed) -> RemoteOutcome {
        client.apply_remote(committed.revision, &committed.operation).unwrap()
    }

    #[test]
    fn test_state_transitions() {
        let mut doc = ClientDocument::from_snapshot("alice", 0, Delta::from_text("ab"));
        assert_eq!(doc.state(), ClientState::Synchronized);

        let first = doc.apply_local(Delta::new().insert("x")).unwrap().unwrap();
        assert_eq!((first.seq, first.revision), (1, 0));
        assert_eq!(doc.state(), ClientState::AwaitingConfirm);

        assert!(doc.apply_local(Delta::new().retain(3).insert("y")).unwrap().is_none());
        assert!(doc.apply_local(Delta::new().insert("z")).unwrap().is_none());
        assert_eq!(doc.state(), ClientState::AwaitingWithBuffer);
        assert_eq!(doc.text(), "zxaby");

        let next = doc.acknowledge(1, 1).unwrap().unwrap();
        assert_eq!((next.seq, next.revision), (2, 1));
        assert_eq!(doc.state(), ClientState::AwaitingConfirm);

        assert!(doc.acknowledge(2, 2).unwrap().is_none());
        assert_eq!(doc.state(), ClientState::Synchronized);
        assert_eq!(doc.revision(), 2);
    }

    #[test]
    fn test_stale_ack_is_ignored() {
        let mut doc = ClientDocument::new("alice");
        doc.apply_local(Delta::new().insert("a")).unwrap();
        assert_eq!(doc.acknowledge(42, 1).unwrap(), None);
        assert_eq!(doc.state(), ClientState::AwaitingConfirm);
        assert_eq!(doc.revision(), 0);
    }

    #[test]
    fn test_out_of_order_remote_is_a_gap() {
        let mut doc = ClientDocument::new("alice");
        let op = Operation::new("bob", 1, 2, Delta::new().insert("b"));
        assert_eq!(
            doc.apply_remote(3, &op),
            Err(ClientError::Gap { expected: 1, actual: 3 })
        );
        assert_eq!(doc.apply_remote(0, &op), Ok(RemoteOutcome::Ignored));
    }

    #[test]
    fn test_two_clients_converge_through_server() {
        let mut server = Server::new("hello");
        let mut alice = ClientDocument::from_snapshot("alice", 0, Delta::from_text("hello"));
        let mut bob = ClientDocument::from_snapshot("bob", 0, Delta::from_text("hello"));

        let a1 = alice.apply_local(Delta::new().insert("A")).unwrap().unwrap();
        assert!(alice.apply_local(Delta::new().retain(6).insert("!")).unwrap().is_none());
        let b1 = bob.apply_local(Delta::new().delete(1).insert("J")).unwrap().unwrap();

        // Server receives bob first.
        let c1 = server.receive(&b1);
        let c2 = server.receive(&a1);

        // Each stream is delivered in revision order.
        assert_eq!(deliver(&mut bob, &c1), RemoteOutcome::Acknowledged(None));
        assert!(matches!(deliver(&mut bob, &c2), RemoteOutcome::Applied(_)));

        assert!(matches!(deliver(&mut alice, &c1), RemoteOutcome::Applied(_)));
        let a2 = match deliver(&mut alice, &c2) {
            RemoteOutcome::Acknowledged(Some(next)) => next,
            other => panic!("expected buffered op, got {other:?}"),
        };
        let c3 = server.receive(&a2);
        assert_eq!(deliver(&mut alice, &c3), RemoteOutcome::Acknowledged(None));
        assert!(matches!(deliver(&mut bob, &c3), RemoteOutcome::Applied(_)));

        assert_eq!(server.state.text(), "AJello!");
        assert_eq!(alice.text(), server.state.text());
        assert_eq!(bob.text(), server.state.text());
        assert_eq!(alice.revision(), 3);
        assert_eq!(bob.revision(), 3);
    }

    #[test]
    fn test_tie_break_matches_server() {
        let mut server = Server::new("");
        let mut alice = ClientDocument::new("alice");
        let mut bob = ClientDocument::new("bob");

        let b = bob.apply_local(Delta::new().insert("bar")).unwrap().unwrap();
        let a = alice.apply_local(Delta::new().insert("foo")).unwrap().unwrap();
        let c1 = server.receive(&b);
        let c2 = server.receive(&a);

        deliver(&mut alice, &c1);
        deliver(&mut alice, &c2);
        deliver(&mut bob, &c1);
        deliver(&mut bob, &c2);

        assert_eq!(server.state.text(), "foobar");
        assert_eq!(alice.text(), "foobar");
        assert_eq!(bob.text(), "foobar");
    }

    #[test]
    fn test_rejoin_with_missed_resends_pending() {
        let mut server = Server::new("ab");
        let mut alice = ClientDocument::from_snapshot("alice", 0, Delta::from_text("ab"));

        // Offline edit, never delivered.
        alice.apply_local(Delta::new().retain(2).insert("!")).unwrap();
        let remote = server.receive(&Operation::new("bob", 1, 0, Delta::new().insert(">")));

        let outcome = alice
            .on_joined(1, server.state.content().clone(), Some(vec![remote]))
            .unwrap();
        let resend = match outcome {
            JoinOutcome::Resumed { resend: Some(op) } => op,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!((resend.seq, resend.revision), (1, 1));

        let committed = server.receive(&resend);
        deliver(&mut alice, &committed);
        assert_eq!(server.state.text(), ">ab!");
        assert_eq!(alice.text(), ">ab!");
        assert_eq!(alice.state(), ClientState::Synchronized);
    }

    #[test]
    fn test_rejoin_recognises_own_committed_operation() {
        let mut server = Server::new("");
        let mut alice = ClientDocument::new("alice");
        let sent = alice.apply_local(Delta::new().insert("hi")).unwrap().unwrap();
        // Committed, but the ack was lost with the connection.
        let committed = server.receive(&sent);

        let outcome = alice
            .on_joined(1, server.state.content().clone(), Some(vec![committed]))
            .unwrap();
        assert_eq!(outcome, JoinOutcome::Resumed { resend: None });
        assert_eq!(alice.state(), ClientState::Synchronized);
        assert_eq!(alice.text(), "hi");
    }

    #[test]
    fn test_join_without_history_resets() {
        let mut alice = ClientDocument::new("alice");
        alice.apply_local(Delta::new().insert("lost")).unwrap();

        let outcome = alice.on_joined(40, Delta::from_text("server"), None).unwrap();
        assert_eq!(outcome, JoinOutcome::Reset { discarded_local: true });
        assert_eq!(alice.text(), "server");
        assert_eq!(alice.revision(), 40);
        assert_eq!(alice.state(), ClientState::Synchronized);
    }

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("p1", "Alice", doc_id, "ws://localhost:9090");
        assert_eq!(client.participant_id(), "p1");
        assert_eq!(client.document_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_offline_edits_stay_pending() {
        let client = SyncClient::new("p1", "Alice", Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);

        client.edit(Delta::new().insert("a")).await.unwrap();
        client.edit(Delta::new().retain(1).insert("b")).await.unwrap();

        assert_eq!(client.text().await, "ab");
        assert_eq!(client.client_state().await, ClientState::AwaitingWithBuffer);
        // Cursor updates are dropped offline, chat needs a connection.
        client.move_cursor(CursorRange::caret(1)).await.unwrap();
        assert!(client.send_chat("hi").await.is_err());
    }
}
