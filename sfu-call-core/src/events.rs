//! Upward event surface
//!
//! State-machine transitions and track notifications for the UI/state layer.

use crate::lifecycle::{ConnectionState, RingingState};
use crate::types::{MediaTrackHandle, ParticipantInfo, SessionId, TrackType};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Call events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEvent {
    /// Connection lifecycle moved
    ConnectionChanged(ConnectionState),
    /// Ringing lifecycle moved
    RingingChanged(RingingState),
    /// A track handle was registered
    TrackAdded(MediaTrackHandle),
    /// A track handle was disposed
    TrackRemoved {
        /// Owning session
        session_id: SessionId,
        /// Track type
        track_type: TrackType,
    },
    /// A remote participant muted or unmuted a track
    TrackEnabledChanged {
        /// Owning session
        session_id: SessionId,
        /// Track type
        track_type: TrackType,
        /// New state
        enabled: bool,
    },
    /// A participant joined the call
    ParticipantJoined(ParticipantInfo),
    /// A participant left the call
    ParticipantLeft(ParticipantInfo),
    /// The SFU changed which encodings are published
    PublishQualityChanged {
        /// Published track
        track_type: TrackType,
        /// Encodings now active
        enabled_rids: Vec<String>,
    },
}

/// Broadcast fan-out of [`CallEvent`]s
///
/// Slow receivers lag and lose the oldest events.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CallEvent>,
}

impl EventBus {
    /// Create a bus with the given capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event; having no receivers is not an error
    pub fn emit(&self, event: CallEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
