//! # collabwrite-sync: Real-time synchronization for CollabWrite
//!
//! Central-server operational transform: every document has one
//! authoritative actor that orders edits, and editors converge by
//! transforming their pending edits against what the server commits.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per editor)│     Binary Proto    │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌──────────────┐                    ┌─────────────┐
//! │ClientDocument│                    │ Coordinator │
//! │ (replica)    │                    │  └ actor per │
//! └──────────────┘                    │    document │
//!                                     └──────┬──────┘
//!                            ┌───────────────┼───────────────┐
//!                            ▼               ▼               ▼
//!                     BroadcastGroup  SessionRegistry  PersistenceGateway
//!                       (fan-out)       (presence)     (RocksDB / memory)
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: Per-document actors: ordering, rebasing, checkpoints
//! - [`storage`]: Checkpoints, change log and versions behind one trait
//! - [`session`]: Who is editing what, cursor colors
//! - [`broadcast`]: Per-document event fan-out with lag detection
//! - [`protocol`]: Binary wire protocol (bincode-encoded messages)
//! - [`server`]: WebSocket sync server
//! - [`client`]: Editor-side state machine and WebSocket client

pub mod broadcast;
pub mod client;
pub mod coordinator;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, DocumentEvent};
pub use client::{
    ClientDocument, ClientError, ClientState, ConnectionState, JoinOutcome, RemoteOutcome,
    SyncClient, SyncEvent,
};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, DocumentStats, SubmitError, Submitted,
    Subscription,
};
pub use protocol::{
    ChatMessage, ClientMessage, ProtocolError, RejectReason, SaveStatus, ServerMessage,
};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{color_for, CursorRange, Session, SessionRegistry, PALETTE};
pub use storage::{
    recover, Checkpoint, DocumentMetadata, MemoryStore, PersistenceGateway, Recovered, RocksStore,
    StoreConfig, StoreError,
};
