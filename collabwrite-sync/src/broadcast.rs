//! Fan-out of document events to every subscriber of one document.
//!
//! Uses a tokio broadcast channel so a publish is O(1) regardless of the
//! number of subscribers. Each subscriber buffers up to `capacity` events;
//! a subscriber that falls further behind observes `RecvError::Lagged` and
//! must catch up from the change log instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use collabwrite_core::Committed;
use tokio::sync::broadcast;

use crate::protocol::{ChatMessage, SaveStatus};
use crate::session::{CursorRange, Session};

/// Everything a document actor tells its subscribers.
///
/// Commits are published in strictly increasing revision order.
#[derive(Debug, Clone)]
pub enum DocumentEvent {
    Committed(Arc<Committed>),
    SessionJoined(Session),
    SessionLeft { participant_id: String },
    CursorMoved { participant_id: String, range: CursorRange },
    Chat(ChatMessage),
    SaveStatus(SaveStatus),
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub events_sent: u64,
    /// Events published while nobody was subscribed
    pub events_unobserved: u64,
    pub subscribers: usize,
}

#[derive(Debug, Default)]
struct AtomicBroadcastStats {
    events_sent: AtomicU64,
    events_unobserved: AtomicU64,
}

/// Broadcast group for a single document.
///
/// Stats are atomics so publishing never takes a lock.
#[derive(Debug, Clone)]
pub struct BroadcastGroup {
    sender: broadcast::Sender<DocumentEvent>,
    capacity: usize,
    stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is the number of events buffered per subscriber before
    /// a slow subscriber starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            capacity: capacity.max(1),
            stats: Arc::new(AtomicBroadcastStats::default()),
        }
    }

    /// Publish an event. Returns the number of subscribers it reached.
    pub fn publish(&self, event: DocumentEvent) -> usize {
        self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
        match self.sender.send(event) {
            Ok(count) => count,
            Err(_) => {
                self.stats.events_unobserved.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_unobserved: self.stats.events_unobserved.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}
