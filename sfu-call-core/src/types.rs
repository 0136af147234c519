//! Call session types and data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of one participant session on the SFU
///
/// Every join produces a fresh session id. Remote tracks are keyed by the
/// session id of the participant that publishes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    /// Create a new random session ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Kind of media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackType {
    /// Microphone audio
    Audio,
    /// Camera video
    Video,
    /// Screen share video
    ScreenShare,
}

impl TrackType {
    /// All track types, in a stable order
    pub const ALL: [TrackType; 3] = [TrackType::Audio, TrackType::Video, TrackType::ScreenShare];

    /// Whether the track carries video frames
    pub fn is_video(&self) -> bool {
        matches!(self, Self::Video | Self::ScreenShare)
    }

    /// Stable lowercase name, used in stream ids and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ScreenShare => "screen_share",
        }
    }

    /// Parse the lowercase name produced by [`TrackType::as_str`]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "screen_share" => Some(Self::ScreenShare),
            _ => None,
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which of the two peer connections a message or action refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    /// Sends local tracks to the SFU
    Publisher,
    /// Receives remote tracks from the SFU
    Subscriber,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => f.write_str("publisher"),
            Self::Subscriber => f.write_str("subscriber"),
        }
    }
}

/// Connection details of one SFU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SfuEndpoint {
    /// HTTP URL of the SFU, also its identity
    pub url: String,
    /// Signaling websocket URL
    pub websocket_url: String,
    /// Token authorizing this client on the SFU
    pub token: String,
}

/// ICE server as handed out by the coordinator
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    /// STUN/TURN URLs
    pub urls: Vec<String>,
    /// Optional username
    pub username: Option<String>,
    /// Optional credential
    pub credential: Option<String>,
}

/// ICE candidate exchanged through signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// SDP media ID
    pub sdp_mid: Option<String>,
    /// SDP media line index
    pub sdp_mline_index: Option<u16>,
}

/// Video dimension requested for a subscription or produced by a layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VideoDimension {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl VideoDimension {
    /// 320x180
    pub const LOW: VideoDimension = VideoDimension::new(320, 180);
    /// 640x360
    pub const MEDIUM: VideoDimension = VideoDimension::new(640, 360);
    /// 1280x720
    pub const HIGH: VideoDimension = VideoDimension::new(1280, 720);

    /// Create a dimension
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for VideoDimension {
    fn default() -> Self {
        Self::MEDIUM
    }
}

/// One simulcast encoding of a published video track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoLayer {
    /// RTP stream id (`q`, `h`, `f`)
    pub rid: String,
    /// Encoded dimension
    pub dimension: VideoDimension,
    /// Maximum bitrate in bits per second
    pub max_bitrate: u32,
    /// Whether the encoding is currently sent
    pub active: bool,
}

impl VideoLayer {
    /// Default three-layer simulcast ladder for a camera track
    pub fn default_simulcast() -> Vec<VideoLayer> {
        vec![
            VideoLayer {
                rid: "q".to_string(),
                dimension: VideoDimension::LOW,
                max_bitrate: 300_000,
                active: true,
            },
            VideoLayer {
                rid: "h".to_string(),
                dimension: VideoDimension::MEDIUM,
                max_bitrate: 750_000,
                active: true,
            },
            VideoLayer {
                rid: "f".to_string(),
                dimension: VideoDimension::HIGH,
                max_bitrate: 1_500_000,
                active: true,
            },
        ]
    }

    /// The full-resolution layer alone, for senders without simulcast
    pub fn single() -> Vec<VideoLayer> {
        Self::default_simulcast()
            .into_iter()
            .filter(|layer| layer.dimension == VideoDimension::HIGH)
            .collect()
    }
}

/// A track announced by the local publisher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    /// Track type
    pub track_type: TrackType,
    /// Engine-assigned track id
    pub track_id: String,
    /// Simulcast layers (empty for audio)
    pub layers: Vec<VideoLayer>,
    /// Whether the track is muted
    pub muted: bool,
}

/// One entry of the desired inbound subscription set
///
/// The SFU receives the complete list on every change and is the source of
/// truth for what it actually forwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackSubscriptionDetail {
    /// User id of the participant publishing the track
    pub participant_id: String,
    /// Session owning the track
    pub session_id: SessionId,
    /// Track type
    pub track_type: TrackType,
    /// Requested resolution (video only)
    pub dimension: Option<VideoDimension>,
}

/// Participant as seen by the SFU
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    /// User id
    pub user_id: String,
    /// Session id
    pub session_id: SessionId,
    /// Tracks currently published
    pub published_tracks: Vec<TrackType>,
}

/// Call settings relevant to the session layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSettings {
    /// Local user may publish audio
    pub can_publish_audio: bool,
    /// Local user may publish video
    pub can_publish_video: bool,
    /// Microphone enabled on join
    pub audio_on_by_default: bool,
    /// Camera enabled on join
    pub video_on_by_default: bool,
}

impl CallSettings {
    /// Whether the local user may publish anything at all
    pub fn can_publish(&self) -> bool {
        self.can_publish_audio || self.can_publish_video
    }
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            can_publish_audio: true,
            can_publish_video: true,
            audio_on_by_default: true,
            video_on_by_default: false,
        }
    }
}

/// Result of the coordinator's join-call RPC
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinCallResponse {
    /// SFU to connect to
    pub credentials: SfuEndpoint,
    /// ICE servers for both peer connections
    pub ice_servers: Vec<IceServer>,
    /// Participants already in the call
    pub participants: Vec<ParticipantInfo>,
    /// Settings of the call
    pub call_settings: CallSettings,
}

/// Reconnect strategy sent to the SFU with a reconnecting join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectStrategy {
    /// Same SFU, same session, new socket
    Fast,
    /// Fresh credentials and a brand-new session
    Rejoin,
    /// New SFU while the old one keeps running
    Migrate,
}

impl ReconnectStrategy {
    /// Single-flight key for this strategy
    pub fn key(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Rejoin => "rejoin",
            Self::Migrate => "migrate",
        }
    }
}

impl fmt::Display for ReconnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Snapshot of a session taken when a reconnect is requested
///
/// Sent to the SFU with the reconnecting join so that it can restore
/// publishing and subscription state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectAttemptContext {
    /// Reconnect strategy
    pub strategy: ReconnectStrategy,
    /// Session being replaced or resumed
    pub previous_session_id: SessionId,
    /// Tracks the previous session published
    pub announced_tracks: Vec<TrackInfo>,
    /// Subscriptions the previous session held
    pub subscriptions: Vec<TrackSubscriptionDetail>,
    /// Rejoin attempt counter
    pub attempt: u32,
    /// Why the reconnect happened
    pub reason: String,
    /// SFU being left during a migration
    pub from_sfu: Option<String>,
}

/// Point-in-time view of a session used to build reconnect contexts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SfuInfoSnapshot {
    /// Session id
    pub session_id: SessionId,
    /// SFU URL the session is bound to
    pub sfu_url: String,
    /// Current desired subscriptions
    pub subscriptions: Vec<TrackSubscriptionDetail>,
    /// Currently published tracks
    pub announced_tracks: Vec<TrackInfo>,
}

impl SfuInfoSnapshot {
    /// Turn the snapshot into a reconnect context
    pub fn into_context(
        self,
        strategy: ReconnectStrategy,
        attempt: u32,
        reason: impl Into<String>,
    ) -> ReconnectAttemptContext {
        let from_sfu = (strategy == ReconnectStrategy::Migrate).then(|| self.sfu_url.clone());
        ReconnectAttemptContext {
            strategy,
            previous_session_id: self.session_id,
            announced_tracks: self.announced_tracks,
            subscriptions: self.subscriptions,
            attempt,
            reason: reason.into(),
            from_sfu,
        }
    }
}

/// Handle to a media track held by a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaTrackHandle {
    /// Engine track id
    pub track_id: String,
    /// Owning session
    pub session_id: SessionId,
    /// Track type
    pub track_type: TrackType,
    /// Whether the owner currently publishes the track unmuted
    pub enabled: bool,
    /// When the handle was created
    pub created_at: DateTime<Utc>,
}

impl MediaTrackHandle {
    /// Create a handle for a newly surfaced track
    pub fn new(track_id: impl Into<String>, session_id: SessionId, track_type: TrackType) -> Self {
        Self {
            track_id: track_id.into(),
            session_id,
            track_type,
            enabled: true,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id() {
        let id1 = SessionId::new();
        let id2 = SessionId::new();
        assert_ne!(id1, id2);
        assert_eq!(SessionId::from("abc").as_str(), "abc");
    }

    #[test]
    fn test_track_type_names() {
        for track_type in TrackType::ALL {
            assert_eq!(TrackType::parse(track_type.as_str()), Some(track_type));
        }
        assert_eq!(TrackType::parse("data"), None);
        assert!(TrackType::ScreenShare.is_video());
        assert!(!TrackType::Audio.is_video());
    }

    #[test]
    fn test_snapshot_into_migrate_context() {
        let snapshot = SfuInfoSnapshot {
            session_id: SessionId::from("s1"),
            sfu_url: "https://sfu-1".to_string(),
            subscriptions: Vec::new(),
            announced_tracks: Vec::new(),
        };

        let ctx = snapshot
            .clone()
            .into_context(ReconnectStrategy::Migrate, 2, "go away");
        assert_eq!(ctx.from_sfu.as_deref(), Some("https://sfu-1"));
        assert_eq!(ctx.attempt, 2);
        assert_eq!(ctx.previous_session_id, SessionId::from("s1"));

        let ctx = snapshot.into_context(ReconnectStrategy::Fast, 0, "network");
        assert_eq!(ctx.from_sfu, None);
    }

    #[test]
    fn test_call_settings_can_publish() {
        let mut settings = CallSettings::default();
        assert!(settings.can_publish());
        settings.can_publish_audio = false;
        settings.can_publish_video = false;
        assert!(!settings.can_publish());
    }

    #[test]
    fn test_strategy_serialization() {
        let json = serde_json::to_string(&ReconnectStrategy::Migrate).unwrap();
        assert_eq!(json, "\"migrate\"");
    }
}
