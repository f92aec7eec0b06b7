//! Session registry: who is editing which document.
//!
//! Sessions are ephemeral. They are created when a participant joins a
//! document, updated as their cursor moves, and dropped on leave or
//! disconnect. Nothing here is ever persisted.
//!
//! ```text
//! join(doc, alice, "Alice") ──► Session { color: "#6BCB77", cursor: None }
//!        │
//!        ▼  cursor-move
//! update_cursor(doc, alice, 4..9)
//!        │
//!        ▼  disconnect
//! leave(doc, alice) ──► removed, document entry dropped when empty
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cursor colors, picked by display name.
pub const PALETTE: [&str; 5] = ["#FF6B6B", "#6BCB77", "#4D96FF", "#FFD93D", "#FF8C00"];

/// Stable color for a display name.
///
/// Only the first character matters, so a reconnect (or the same name in a
/// different tab) always gets the same color.
pub fn color_for(display_name: &str) -> &'static str {
    let first = display_name.chars().next().map_or(0, u32::from);
    PALETTE[(first as usize) % PALETTE.len()]
}

/// Selected range in document positions. `length == 0` is a caret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorRange {
    pub index: usize,
    pub length: usize,
}

impl CursorRange {
    pub fn caret(index: usize) -> Self {
        Self { index, length: 0 }
    }

    pub fn end(&self) -> usize {
        self.index + self.length
    }
}

/// A participant connected to a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub document_id: Uuid,
    pub participant_id: String,
    pub display_name: String,
    pub color: String,
    /// Last known cursor, `None` until the first cursor update
    pub cursor: Option<CursorRange>,
}

/// In-memory registry of active sessions, keyed by document.
///
/// Participants within a document are ordered by id so listings are
/// deterministic.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    documents: HashMap<Uuid, BTreeMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a participant and return their color.
    ///
    /// Joining again with the same participant id replaces the old session
    /// (a reconnect) and resets its cursor.
    pub fn join(&mut self, document_id: Uuid, participant_id: &str, display_name: &str) -> String {
        let color = color_for(display_name).to_string();
        let session = Session {
            document_id,
            participant_id: participant_id.to_string(),
            display_name: display_name.to_string(),
            color: color.clone(),
            cursor: None,
        };

        let replaced = self
            .documents
            .entry(document_id)
            .or_default()
            .insert(participant_id.to_string(), session)
            .is_some();

        if replaced {
            log::debug!("Session {participant_id} rejoined doc {document_id}");
        } else {
            log::debug!("Session {participant_id} ({display_name}) joined doc {document_id}");
        }
        color
    }

    /// Remove a participant. Returns the removed session, if any.
    pub fn leave(&mut self, document_id: Uuid, participant_id: &str) -> Option<Session> {
        let sessions = self.documents.get_mut(&document_id)?;
        let removed = sessions.remove(participant_id);
        if sessions.is_empty() {
            self.documents.remove(&document_id);
        }
        removed
    }

    /// Active sessions for a document, ordered by participant id.
    pub fn list_active(&self, document_id: Uuid) -> Vec<Session> {
        self.documents
            .get(&document_id)
            .map(|sessions| sessions.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a participant's cursor. Returns `false` for unknown sessions.
    pub fn update_cursor(
        &mut self,
        document_id: Uuid,
        participant_id: &str,
        range: CursorRange,
    ) -> bool {
        match self
            .documents
            .get_mut(&document_id)
            .and_then(|sessions| sessions.get_mut(participant_id))
        {
            Some(session) => {
                session.cursor = Some(range);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, document_id: Uuid, participant_id: &str) -> Option<&Session> {
        self.documents.get(&document_id)?.get(participant_id)
    }

    pub fn participant_count(&self, document_id: Uuid) -> usize {
        self.documents.get(&document_id).map_or(0, BTreeMap::len)
    }

    /// Documents with at least one active session.
    pub fn active_documents(&self) -> Vec<Uuid> {
        self.documents.keys().copied().collect()
    }
}
