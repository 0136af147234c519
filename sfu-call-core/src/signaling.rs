//! SFU signaling protocol
//!
//! A persistent channel to one SFU carrying typed inbound events and typed
//! unary RPCs. The transport is abstract: implement [`SignalingTransport`]
//! for a websocket client, or use the in-memory loopback for tests.

use crate::stats::SessionStats;
use crate::types::{
    IceCandidate, ParticipantInfo, PeerRole, ReconnectAttemptContext, SessionId, SfuEndpoint,
    TrackInfo, TrackSubscriptionDetail, TrackType,
};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// Request timed out
    #[error("Request timed out: {0}")]
    Timeout(String),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Socket closed underneath the request
    #[error("Signaling connection closed")]
    ConnectionClosed,

    /// Credentials rejected
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Request rejected as malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The owning session is leaving and accepts no further RPCs
    #[error("Session is closed")]
    SessionClosed,
}

/// Error taxonomy used by every retry loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup or timeout; worth retrying
    Transient,
    /// Retrying cannot succeed
    Permanent,
}

impl SignalingError {
    /// Classify the error
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Timeout(_) | Self::Transport(_) | Self::ConnectionClosed => ErrorClass::Transient,
            Self::Unauthorized(_) | Self::InvalidRequest(_) | Self::SessionClosed => {
                ErrorClass::Permanent
            }
        }
    }

    /// Shorthand for `class() == Permanent`
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.class() == ErrorClass::Permanent
    }
}

/// What the SFU asks the client to do after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectHint {
    /// Reconnect the socket and restart ICE
    Fast,
    /// Join again with a new session
    Rejoin,
    /// Move to another SFU
    Migrate,
    /// Give up and leave the call
    Disconnect,
}

/// Inbound event from the SFU
///
/// The set is closed; every consumer matches exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SfuEvent {
    /// Join accepted; the socket is ready for RPCs
    JoinResponse {
        /// Participants already present
        participants: Vec<ParticipantInfo>,
        /// The SFU restored the previous session
        fast_reconnected: bool,
    },

    /// The SFU (re)negotiates the subscriber connection
    SubscriberOffer {
        /// Offer SDP
        sdp: String,
    },

    /// Remote ICE candidate
    IceTrickle {
        /// Target peer connection
        role: PeerRole,
        /// Candidate
        candidate: IceCandidate,
    },

    /// A participant started publishing or unmuted a track
    TrackPublished {
        /// Publishing user
        user_id: String,
        /// Publishing session
        session_id: SessionId,
        /// Track type
        track_type: TrackType,
    },

    /// A participant stopped publishing or muted a track
    TrackUnpublished {
        /// Publishing user
        user_id: String,
        /// Publishing session
        session_id: SessionId,
        /// Track type
        track_type: TrackType,
    },

    /// A participant joined
    ParticipantJoined {
        /// Participant
        participant: ParticipantInfo,
    },

    /// A participant left
    ParticipantLeft {
        /// Participant
        participant: ParticipantInfo,
    },

    /// Enable only the listed simulcast encodings of a published track
    ChangePublishQuality {
        /// Published track
        track_type: TrackType,
        /// Encodings to keep active, by rid
        enabled_rids: Vec<String>,
    },

    /// The SFU is shutting down; migrate away
    GoAway {
        /// Reason given by the SFU
        reason: String,
    },

    /// SFU-side error with a reconnect hint
    Error {
        /// Error description
        message: String,
        /// Suggested recovery
        hint: ReconnectHint,
    },
}

impl SfuEvent {
    /// Short name for tracing
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinResponse { .. } => "JoinResponse",
            Self::SubscriberOffer { .. } => "SubscriberOffer",
            Self::IceTrickle { .. } => "IceTrickle",
            Self::TrackPublished { .. } => "TrackPublished",
            Self::TrackUnpublished { .. } => "TrackUnpublished",
            Self::ParticipantJoined { .. } => "ParticipantJoined",
            Self::ParticipantLeft { .. } => "ParticipantLeft",
            Self::ChangePublishQuality { .. } => "ChangePublishQuality",
            Self::GoAway { .. } => "GoAway",
            Self::Error { .. } => "Error",
        }
    }
}

/// Join request sent right after the socket opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Session joining
    pub session_id: SessionId,
    /// SFU token
    pub token: String,
    /// Receive-only offer describing what the client can subscribe to
    pub subscriber_sdp: String,
    /// Present when this join resumes or replaces an earlier session
    pub reconnect: Option<ReconnectAttemptContext>,
}

/// Mute state of one local track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrackMuteState {
    /// Track type
    pub track_type: TrackType,
    /// Muted
    pub muted: bool,
}

/// Unary RPCs of one signaling connection
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Send the join request; the answer arrives as [`SfuEvent::JoinResponse`]
    async fn join(&self, request: JoinRequest) -> Result<(), SignalingError>;

    /// Answer a subscriber offer
    async fn send_answer(&self, session_id: &SessionId, sdp: String)
        -> Result<(), SignalingError>;

    /// Forward a local ICE candidate
    async fn ice_trickle(
        &self,
        session_id: &SessionId,
        role: PeerRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError>;

    /// Send the publisher offer and the announced tracks, returning the answer SDP
    async fn set_publisher(
        &self,
        session_id: &SessionId,
        sdp: String,
        tracks: Vec<TrackInfo>,
    ) -> Result<String, SignalingError>;

    /// Replace the complete subscription set
    async fn update_subscriptions(
        &self,
        session_id: &SessionId,
        tracks: Vec<TrackSubscriptionDetail>,
    ) -> Result<(), SignalingError>;

    /// Replace the complete mute-state set
    async fn update_mute_states(
        &self,
        session_id: &SessionId,
        states: Vec<TrackMuteState>,
    ) -> Result<(), SignalingError>;

    /// Ask the SFU to restart ICE on the given peer connection
    async fn ice_restart(&self, session_id: &SessionId, role: PeerRole)
        -> Result<(), SignalingError>;

    /// Report session statistics
    async fn send_stats(
        &self,
        session_id: &SessionId,
        stats: SessionStats,
    ) -> Result<(), SignalingError>;

    /// Announce that the session leaves
    async fn leave(&self, session_id: &SessionId, reason: String) -> Result<(), SignalingError>;

    /// Close the socket; idempotent
    async fn close(&self);
}

/// An open signaling connection
pub struct SignalingConnection {
    /// RPC half
    pub channel: Arc<dyn SignalingChannel>,
    /// Inbound events, in arrival order
    pub events: mpsc::Receiver<SfuEvent>,
}

/// Opens signaling connections
///
/// Implement this for your specific transport (websocket, in-memory, ...)
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Open a socket to the SFU
    async fn connect(&self, endpoint: &SfuEndpoint) -> Result<SignalingConnection, SignalingError>;
}

/// Signaling handler bound to one session
///
/// Holds the session's current socket, which a fast reconnect swaps, and a
/// leaving gate: once [`SignalingHandler::mark_leaving`] is called every RPC
/// except `leave` and `send_stats` fails with [`SignalingError::SessionClosed`],
/// which retry loops treat as permanent.
pub struct SignalingHandler {
    channel: RwLock<Option<Arc<dyn SignalingChannel>>>,
    session_id: SessionId,
    sfu: String,
    leaving: AtomicBool,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl SignalingHandler {
    /// Create new signaling handler without a socket
    #[must_use]
    pub fn new(session_id: SessionId, sfu: String) -> Self {
        Self {
            channel: RwLock::new(None),
            session_id,
            sfu,
            leaving: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Session this handler belongs to
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Use `channel` for all further RPCs, returning the previous one
    pub fn attach(&self, channel: Arc<dyn SignalingChannel>) -> Option<Arc<dyn SignalingChannel>> {
        self.channel.write().replace(channel)
    }

    /// Whether a socket is attached
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.channel.read().is_some()
    }

    /// Stop accepting outbound RPCs; returns `false` if already leaving
    pub fn mark_leaving(&self) -> bool {
        !self.leaving.swap(true, Ordering::SeqCst)
    }

    /// Whether the session is leaving
    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.leaving.load(Ordering::SeqCst)
    }

    /// RPCs sent and RPCs failed so far
    #[must_use]
    pub fn counters(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.failed.load(Ordering::Relaxed),
        )
    }

    fn channel(&self) -> Result<Arc<dyn SignalingChannel>, SignalingError> {
        self.channel
            .read()
            .clone()
            .ok_or(SignalingError::ConnectionClosed)
    }

    fn gated_channel(&self) -> Result<Arc<dyn SignalingChannel>, SignalingError> {
        if self.is_leaving() {
            return Err(SignalingError::SessionClosed);
        }
        self.channel()
    }

    fn record<T>(
        &self,
        rpc: &'static str,
        result: Result<T, SignalingError>,
    ) -> Result<T, SignalingError> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = &result {
            self.failed.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(rpc, error = %e, "Signaling RPC failed");
        }
        result
    }

    /// Send the join request
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self, request), fields(session_id = %self.session_id, sfu = %self.sfu, reconnect = request.reconnect.is_some()))]
    pub async fn join(&self, request: JoinRequest) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        tracing::debug!("Sending join request");
        let result = channel.join(request).await;
        self.record("join", result)
    }

    /// Send the subscriber answer
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self, sdp), fields(session_id = %self.session_id))]
    pub async fn send_answer(&self, sdp: String) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        let result = channel.send_answer(&self.session_id, sdp).await;
        self.record("send_answer", result)
    }

    /// Forward a local ICE candidate
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    pub async fn ice_trickle(
        &self,
        role: PeerRole,
        candidate: IceCandidate,
    ) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        tracing::trace!(session_id = %self.session_id, %role, candidate = %candidate.candidate, "Trickling ICE candidate");
        let result = channel.ice_trickle(&self.session_id, role, candidate).await;
        self.record("ice_trickle", result)
    }

    /// Send the publisher offer
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self, sdp, tracks), fields(session_id = %self.session_id, tracks = tracks.len()))]
    pub async fn set_publisher(
        &self,
        sdp: String,
        tracks: Vec<TrackInfo>,
    ) -> Result<String, SignalingError> {
        let channel = self.gated_channel()?;
        let result = channel.set_publisher(&self.session_id, sdp, tracks).await;
        self.record("set_publisher", result)
    }

    /// Replace the subscription set
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self, tracks), fields(session_id = %self.session_id, sfu = %self.sfu, tracks = tracks.len()))]
    pub async fn update_subscriptions(
        &self,
        tracks: Vec<TrackSubscriptionDetail>,
    ) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        let result = channel.update_subscriptions(&self.session_id, tracks).await;
        self.record("update_subscriptions", result)
    }

    /// Replace the mute-state set
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self, states), fields(session_id = %self.session_id))]
    pub async fn update_mute_states(
        &self,
        states: Vec<TrackMuteState>,
    ) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        let result = channel.update_mute_states(&self.session_id, states).await;
        self.record("update_mute_states", result)
    }

    /// Ask the SFU to restart ICE
    ///
    /// # Errors
    ///
    /// Returns error if the session is leaving or the request fails
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn ice_restart(&self, role: PeerRole) -> Result<(), SignalingError> {
        let channel = self.gated_channel()?;
        let result = channel.ice_restart(&self.session_id, role).await;
        self.record("ice_restart", result)
    }

    /// Report stats; allowed while leaving so that a replaced session can
    /// still hand over its counters
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    pub async fn send_stats(&self, stats: SessionStats) -> Result<(), SignalingError> {
        let channel = self.channel()?;
        let result = channel.send_stats(&self.session_id, stats).await;
        self.record("send_stats", result)
    }

    /// Announce leaving; allowed while leaving
    ///
    /// # Errors
    ///
    /// Returns error if the request fails
    #[tracing::instrument(skip(self), fields(session_id = %self.session_id))]
    pub async fn leave(&self, reason: String) -> Result<(), SignalingError> {
        let channel = self.channel()?;
        let result = channel.leave(&self.session_id, reason).await;
        self.record("leave", result)
    }

    /// Detach and close the current socket, if any
    pub async fn close(&self) {
        let channel = self.channel.write().take();
        if let Some(channel) = channel {
            channel.close().await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingChannel {
        calls: Mutex<Vec<&'static str>>,
        fail_with: Mutex<Option<SignalingError>>,
    }

    impl RecordingChannel {
        fn push(&self, name: &'static str) -> Result<(), SignalingError> {
            self.calls.lock().unwrap().push(name);
            match self.fail_with.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl SignalingChannel for RecordingChannel {
        async fn join(&self, _request: JoinRequest) -> Result<(), SignalingError> {
            self.push("join")
        }
        async fn send_answer(&self, _: &SessionId, _: String) -> Result<(), SignalingError> {
            self.push("send_answer")
        }
        async fn ice_trickle(
            &self,
            _: &SessionId,
            _: PeerRole,
            _: IceCandidate,
        ) -> Result<(), SignalingError> {
            self.push("ice_trickle")
        }
        async fn set_publisher(
            &self,
            _: &SessionId,
            _: String,
            _: Vec<TrackInfo>,
        ) -> Result<String, SignalingError> {
            self.push("set_publisher").map(|()| "answer".to_string())
        }
        async fn update_subscriptions(
            &self,
            _: &SessionId,
            _: Vec<TrackSubscriptionDetail>,
        ) -> Result<(), SignalingError> {
            self.push("update_subscriptions")
        }
        async fn update_mute_states(
            &self,
            _: &SessionId,
            _: Vec<TrackMuteState>,
        ) -> Result<(), SignalingError> {
            self.push("update_mute_states")
        }
        async fn ice_restart(&self, _: &SessionId, _: PeerRole) -> Result<(), SignalingError> {
            self.push("ice_restart")
        }
        async fn send_stats(&self, _: &SessionId, _: SessionStats) -> Result<(), SignalingError> {
            self.push("send_stats")
        }
        async fn leave(&self, _: &SessionId, _: String) -> Result<(), SignalingError> {
            self.push("leave")
        }
        async fn close(&self) {
            self.calls.lock().unwrap().push("close");
        }
    }

    fn handler() -> (Arc<RecordingChannel>, SignalingHandler) {
        let channel = Arc::new(RecordingChannel::default());
        let handler = SignalingHandler::new(SessionId::from("s1"), "sfu-1".into());
        handler.attach(channel.clone());
        (channel, handler)
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            SignalingError::Timeout("x".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(SignalingError::ConnectionClosed.class(), ErrorClass::Transient);
        assert!(SignalingError::Unauthorized("bad token".into()).is_permanent());
        assert!(SignalingError::SessionClosed.is_permanent());
    }

    #[tokio::test]
    async fn test_leaving_gate_blocks_rpcs() {
        let (channel, handler) = handler();

        handler.update_subscriptions(Vec::new()).await.unwrap();
        assert!(handler.mark_leaving());
        assert!(!handler.mark_leaving());

        let err = handler.update_mute_states(Vec::new()).await.unwrap_err();
        assert_eq!(err, SignalingError::SessionClosed);
        let err = handler.ice_restart(PeerRole::Subscriber).await.unwrap_err();
        assert_eq!(err, SignalingError::SessionClosed);

        // leave and stats still go out
        handler.send_stats(SessionStats::default()).await.unwrap();
        handler.leave("bye".into()).await.unwrap();

        assert_eq!(
            *channel.calls.lock().unwrap(),
            vec!["update_subscriptions", "send_stats", "leave"]
        );
    }

    #[tokio::test]
    async fn test_detached_handler_reports_closed_socket() {
        let (channel, handler) = handler();
        handler.close().await;
        assert!(!handler.is_attached());
        let err = handler.send_answer("sdp".into()).await.unwrap_err();
        assert_eq!(err, SignalingError::ConnectionClosed);
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(*channel.calls.lock().unwrap(), vec!["close"]);
    }

    #[tokio::test]
    async fn test_counters() {
        let (channel, handler) = handler();
        handler.send_answer("sdp".into()).await.unwrap();
        *channel.fail_with.lock().unwrap() = Some(SignalingError::Transport("down".into()));
        assert!(handler.send_answer("sdp".into()).await.is_err());
        assert_eq!(handler.counters(), (2, 1));
    }

    #[test]
    fn test_event_serialization() {
        let event = SfuEvent::Error {
            message: "shutting down".into(),
            hint: ReconnectHint::Migrate,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"error\""));
        assert!(json.contains("\"hint\":\"migrate\""));
        let back: SfuEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.kind(), "Error");
    }
}
