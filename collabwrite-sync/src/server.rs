//! WebSocket sync server.
//!
//! Architecture:
//! ```text
//! Editor A ──┐                     ┌── DocumentActor (doc 1) ── PersistenceWriter
//!            ├── connection task ──┤
//! Editor B ──┘   (one per socket)  └── DocumentActor (doc 2) ── PersistenceWriter
//!                      ▲                        │
//!                      └──── DocumentEvent ─────┘
//! ```
//!
//! Each connection joins one document at a time. Client messages become
//! [`Coordinator`] calls; the document's event stream is relayed back,
//! with the client's own commits turned into acknowledgements.

use std::error::Error;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use collabwrite_core::{ClientId, Operation};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::DocumentEvent;
use crate::coordinator::{Coordinator, CoordinatorConfig, SubmitError};
use crate::protocol::{ClientMessage, RejectReason, ServerMessage};
use crate::storage::{MemoryStore, PersistenceGateway, RocksStore, StoreConfig, StoreError};

type BoxError = Box<dyn Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum participants per document
    pub max_participants_per_document: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub coordinator: CoordinatorConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_participants_per_document: 100,
            heartbeat_interval_secs: 30,
            storage_path: None,
            coordinator: CoordinatorConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub submitted_operations: u64,
    pub rejected_operations: u64,
    pub resyncs: u64,
    pub lagged_events: u64,
}

/// Per-connection view of the joined document.
struct Joined {
    document_id: Uuid,
    participant_id: String,
    client_id: ClientId,
    events: broadcast::Receiver<DocumentEvent>,
    /// Last revision delivered to the client
    revision: u64,
}

impl Joined {
    /// Translate a document event for this participant. Returns `None` for
    /// events the client must not see.
    fn relay(&mut self, event: DocumentEvent) -> Option<ServerMessage> {
        match event {
            DocumentEvent::Committed(committed) => {
                if committed.revision <= self.revision {
                    return None;
                }
                self.revision = committed.revision;
                if *committed.client_id() == self.client_id {
                    Some(ServerMessage::Ack {
                        seq: committed.operation.seq,
                        revision: committed.revision,
                    })
                } else {
                    Some(ServerMessage::Remote {
                        revision: committed.revision,
                        operation: committed.operation.clone(),
                    })
                }
            }
            DocumentEvent::SessionJoined(session)
                if session.participant_id != self.participant_id =>
            {
                Some(ServerMessage::SessionJoined { session })
            }
            DocumentEvent::SessionLeft { participant_id }
                if participant_id != self.participant_id =>
            {
                Some(ServerMessage::SessionLeft { participant_id })
            }
            DocumentEvent::CursorMoved { participant_id, range }
                if participant_id != self.participant_id =>
            {
                Some(ServerMessage::CursorMoved { participant_id, range })
            }
            DocumentEvent::Chat(message) => Some(ServerMessage::Chat(message)),
            DocumentEvent::SaveStatus(status) => Some(ServerMessage::SaveStatus(status)),
            _ => None,
        }
    }
}

#[derive(Clone)]
struct ConnectionContext {
    addr: SocketAddr,
    coordinator: Coordinator,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    coordinator: Coordinator,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening RocksDB storage if a path is configured.
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn PersistenceGateway> = match &config.storage_path {
            Some(path) => Arc::new(RocksStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    /// Create a server over an existing store.
    pub fn with_store(config: ServerConfig, store: Arc<dyn PersistenceGateway>) -> Self {
        Self {
            coordinator: Coordinator::new(config.coordinator.clone(), store),
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// In-memory server with default settings.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Number of documents found in storage.
    pub async fn stored_documents(&self) -> Result<usize, StoreError> {
        let store = Arc::clone(self.coordinator.store());
        tokio::task::spawn_blocking(move || store.list_documents())
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|documents| documents.len())
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener, std::future::pending()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// persist every open document.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<(), BoxError>
    where
        F: Future<Output = ()>,
    {
        match self.stored_documents().await {
            Ok(0) => {}
            Ok(count) => log::info!("{count} documents in persistent storage"),
            Err(e) => log::warn!("Could not list stored documents: {e}"),
        }
        log::info!("Sync server listening on {}", listener.local_addr()?);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                            continue;
                        }
                    };
                    log::debug!("New TCP connection from {addr}");

                    let ctx = ConnectionContext {
                        addr,
                        coordinator: self.coordinator.clone(),
                        stats: self.stats.clone(),
                        config: self.config.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(stream, ctx).await {
                            log::error!("Connection error from {addr}: {e}");
                        }
                    });
                }
                _ = &mut shutdown => {
                    log::info!("Shutdown requested");
                    break;
                }
            }
        }

        self.coordinator.shutdown().await;
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(stream: TcpStream, ctx: ConnectionContext) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let addr = ctx.addr;
        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = ctx.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let period = Duration::from_secs(ctx.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        let mut last_seen = Instant::now();
        let mut joined: Option<Joined> = None;

        let result: Result<(), BoxError> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        last_seen = Instant::now();
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                {
                                    let mut s = ctx.stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += data.len() as u64;
                                }
                                match ClientMessage::decode(&data) {
                                    Ok(client_msg) => {
                                        let replies =
                                            Self::on_client_message(&ctx, &mut joined, client_msg)
                                                .await;
                                        for reply in replies {
                                            send(&mut ws_sender, &reply).await?;
                                        }
                                    }
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        let error = ServerMessage::Error { message: e.to_string() };
                                        send(&mut ws_sender, &error).await?;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    event = async {
                        match joined.as_mut() {
                            Some(j) => j.events.recv().await,
                            // Not joined yet: wait forever
                            None => std::future::pending().await,
                        }
                    } => {
                        let Some(j) = joined.as_mut() else { continue };
                        match event {
                            Ok(event) => {
                                if let Some(reply) = j.relay(event) {
                                    send(&mut ws_sender, &reply).await?;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                log::warn!(
                                    "Participant {} lagged by {skipped} events",
                                    j.participant_id
                                );
                                ctx.stats.write().await.lagged_events += skipped;
                                for reply in Self::catch_up(&ctx, j).await {
                                    send(&mut ws_sender, &reply).await?;
                                }
                            }
                            Err(RecvError::Closed) => {
                                let error = ServerMessage::Error {
                                    message: "document closed".into(),
                                };
                                send(&mut ws_sender, &error).await?;
                                break;
                            }
                        }
                    }

                    _ = heartbeat.tick() => {
                        if last_seen.elapsed() > period * 2 {
                            log::info!("Connection from {addr} timed out");
                            break;
                        }
                        ws_sender.send(Message::Ping(Default::default())).await?;
                    }
                }
            }
            Ok(())
        }
        .await;

        if let Some(j) = joined.take() {
            ctx.coordinator.leave(j.document_id, &j.participant_id).await;
            log::info!("Participant {} left doc {}", j.participant_id, j.document_id);
        }
        ctx.stats.write().await.active_connections -= 1;

        result
    }

    async fn on_client_message(
        ctx: &ConnectionContext,
        joined: &mut Option<Joined>,
        msg: ClientMessage,
    ) -> Vec<ServerMessage> {
        let coordinator = &ctx.coordinator;
        match msg {
            ClientMessage::Join {
                document_id,
                participant_id,
                display_name,
                known_revision,
            } => {
                if let Some(previous) = joined.take() {
                    coordinator.leave(previous.document_id, &previous.participant_id).await;
                }
                let limit = ctx.config.max_participants_per_document;
                if coordinator.participant_count(document_id).await >= limit {
                    return vec![ServerMessage::Error {
                        message: format!("document {document_id} is full"),
                    }];
                }

                let subscription = match coordinator
                    .subscribe(document_id, &participant_id, known_revision)
                    .await
                {
                    Ok(subscription) => subscription,
                    Err(e) => return vec![ServerMessage::Error { message: e.to_string() }],
                };
                let color = coordinator.join(document_id, &participant_id, &display_name).await;
                let participants = coordinator.list_active(document_id).await;
                let revision = subscription.snapshot.revision();

                log::info!(
                    "{display_name} ({participant_id}) joined doc {document_id} at revision {revision}"
                );
                *joined = Some(Joined {
                    document_id,
                    client_id: ClientId::new(participant_id.clone()),
                    participant_id,
                    events: subscription.events,
                    revision,
                });

                vec![ServerMessage::Joined {
                    document_id,
                    revision,
                    content: subscription.snapshot.content().clone(),
                    color,
                    participants,
                    missed: subscription.missed,
                }]
            }

            ClientMessage::Submit { seq, revision, delta } => {
                let Some(j) = joined.as_mut() else {
                    return vec![not_joined()];
                };
                let operation = Operation::new(j.client_id.clone(), seq, revision, delta);
                match coordinator.submit(j.document_id, operation).await {
                    Ok(submitted) => {
                        ctx.stats.write().await.submitted_operations += 1;
                        if submitted.duplicate {
                            vec![ServerMessage::Ack {
                                seq,
                                revision: submitted.revision,
                            }]
                        } else {
                            // The ack follows on the event stream.
                            Vec::new()
                        }
                    }
                    Err(SubmitError::Malformed(reason)) => {
                        ctx.stats.write().await.rejected_operations += 1;
                        vec![ServerMessage::Rejected {
                            seq,
                            reason: RejectReason::Malformed(reason),
                        }]
                    }
                    Err(SubmitError::UnknownRevision { revision, current }) => {
                        ctx.stats.write().await.rejected_operations += 1;
                        vec![ServerMessage::Rejected {
                            seq,
                            reason: RejectReason::UnknownRevision { revision, current },
                        }]
                    }
                    Err(SubmitError::Resync(state)) => {
                        ctx.stats.write().await.resyncs += 1;
                        j.revision = j.revision.max(state.revision());
                        vec![ServerMessage::Resync {
                            revision: state.revision(),
                            content: state.content().clone(),
                        }]
                    }
                    Err(e @ SubmitError::Unavailable(_)) => {
                        vec![ServerMessage::Error { message: e.to_string() }]
                    }
                }
            }

            ClientMessage::Cursor { range } => {
                if let Some(j) = joined.as_ref() {
                    coordinator.update_cursor(j.document_id, &j.participant_id, range).await;
                }
                Vec::new()
            }

            ClientMessage::Chat { text } => {
                let Some(j) = joined.as_ref() else {
                    return vec![not_joined()];
                };
                coordinator.send_chat(j.document_id, &j.participant_id, &text).await;
                Vec::new()
            }

            ClientMessage::ListVersions => {
                let Some(j) = joined.as_ref() else {
                    return vec![not_joined()];
                };
                match coordinator.versions(j.document_id).await {
                    Ok(versions) => vec![ServerMessage::Versions { versions }],
                    Err(e) => vec![ServerMessage::Error { message: e.to_string() }],
                }
            }

            ClientMessage::Leave => {
                if let Some(j) = joined.take() {
                    coordinator.leave(j.document_id, &j.participant_id).await;
                }
                Vec::new()
            }

            ClientMessage::Ping => vec![ServerMessage::Pong],
        }
    }

    /// Re-subscribe after lagging and replay what was skipped.
    async fn catch_up(ctx: &ConnectionContext, j: &mut Joined) -> Vec<ServerMessage> {
        let subscription = match ctx
            .coordinator
            .subscribe(j.document_id, &j.participant_id, Some(j.revision))
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => return vec![ServerMessage::Error { message: e.to_string() }],
        };
        j.events = subscription.events;

        match subscription.missed {
            Some(missed) => missed
                .into_iter()
                .filter_map(|committed| j.relay(DocumentEvent::Committed(Arc::new(committed))))
                .collect(),
            None => {
                ctx.stats.write().await.resyncs += 1;
                j.revision = subscription.snapshot.revision();
                vec![ServerMessage::Resync {
                    revision: subscription.snapshot.revision(),
                    content: subscription.snapshot.content().clone(),
                }]
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

fn not_joined() -> ServerMessage {
    ServerMessage::Error {
        message: "join a document first".into(),
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    ws_sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use collabwrite_core::{Committed, Delta};

    fn joined() -> Joined {
        let (_, events) = broadcast::channel(4);
        Joined {
            document_id: Uuid::new_v4(),
            participant_id: "alice".into(),
            client_id: ClientId::new("alice"),
            events,
            revision: 3,
        }
    }

    fn committed(client: &str, seq: u64, revision: u64) -> DocumentEvent {
        DocumentEvent::Committed(Arc::new(Committed {
            revision,
            operation: Operation::new(client, seq, revision - 1, Delta::new().insert("x")),
        }))
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.max_participants_per_document, 100);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.storage_path.is_none());
        assert_eq!(config.coordinator.max_versions, 10);
    }

    #[tokio::test]
    async fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
        assert_eq!(server.stats().await, ServerStats::default());
        assert_eq!(server.stored_documents().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            storage_path: Some(dir.path().join("db")),
            ..ServerConfig::default()
        };
        let server = SyncServer::new(config).unwrap();
        assert_eq!(server.stored_documents().await.unwrap(), 0);
    }

    #[test]
    fn test_relay_turns_own_commit_into_ack() {
        let mut j = joined();
        assert_eq!(
            j.relay(committed("alice", 9, 4)),
            Some(ServerMessage::Ack { seq: 9, revision: 4 })
        );
        match j.relay(committed("bob", 1, 5)) {
            Some(ServerMessage::Remote { revision: 5, operation }) => {
                assert_eq!(operation.client_id.as_str(), "bob");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(j.revision, 5);
    }

    #[test]
    fn test_relay_skips_delivered_revisions() {
        let mut j = joined();
        assert_eq!(j.relay(committed("bob", 1, 3)), None);
        assert_eq!(j.revision, 3);
    }

    #[test]
    fn test_relay_hides_own_presence() {
        let mut j = joined();
        let own = DocumentEvent::SessionLeft {
            participant_id: "alice".into(),
        };
        let other = DocumentEvent::SessionLeft {
            participant_id: "bob".into(),
        };
        assert_eq!(j.relay(own), None);
        assert_eq!(
            j.relay(other),
            Some(ServerMessage::SessionLeft {
                participant_id: "bob".into()
            })
        );
    }
}
