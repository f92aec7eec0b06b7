//! # collabwrite-core: Document model and operational transform
//!
//! Pure data structures shared by the sync server and clients. Nothing in
//! this crate performs I/O or spawns tasks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   transform()   ┌─────────────┐
//! │ Operation A │ ◄─────────────► │ Operation B │
//! │ (rev N)     │                 │ (rev N)     │
//! └──────┬──────┘                 └──────┬──────┘
//!        │ append                        │
//!        ▼                               ▼
//! ┌─────────────┐    replay       ┌─────────────┐
//! │ ChangeLog   │ ──────────────► │ Document    │
//! │ (ordered)   │                 │ State       │
//! └─────────────┘                 └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`delta`]: Retain / insert / delete deltas with formatting attributes
//! - [`operation`]: Operations and committed operations
//! - [`document`]: Document content at a revision
//! - [`transform`]: Transform engine with deterministic tie-breaking
//! - [`changelog`]: Bounded, gap-free log of committed operations
//! - [`codec`]: bincode + LZ4 encoding for stored records

pub mod changelog;
pub mod codec;
pub mod delta;
pub mod document;
pub mod operation;
pub mod transform;

pub use changelog::{ChangeLog, LogError};
pub use codec::CodecError;
pub use delta::{attributes, AttrValue, Attributes, Bias, Component, Delta, Embed, Insert, OtError};
pub use document::DocumentState;
pub use operation::{ClientId, Committed, Operation};
pub use transform::{transform, transform_deltas};
