//! [`MediaEngine`] backed by the `webrtc` crate
//!
//! Local tracks are sample tracks whose stream id is `"{session_id}:{track_type}"`,
//! which is also how remote tracks are attributed to their publishing session.

use crate::peer::{IceState, MediaEngine, PeerConnection, PeerError, PeerSignal};
use crate::types::{IceCandidate, IceServer, PeerRole, SessionId, TrackInfo, TrackType, VideoLayer};
use anyhow::Context;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine as RtcMediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

fn engine_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::Engine(e.to_string())
}

fn chain_err(e: anyhow::Error) -> PeerError {
    PeerError::Engine(format!("{e:#}"))
}

fn sdp_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::Sdp(e.to_string())
}

fn ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected => IceState::Connected,
        RTCIceConnectionState::Completed => IceState::Completed,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => IceState::New,
    }
}

/// Split a remote stream id into the publishing session and track type
fn parse_stream_id(stream_id: &str) -> Option<(SessionId, TrackType)> {
    let (session, track) = stream_id.rsplit_once(':')?;
    if session.is_empty() {
        return None;
    }
    Some((SessionId(session.to_string()), TrackType::parse(track)?))
}

fn codec_for(track_type: TrackType) -> RTCRtpCodecCapability {
    if track_type.is_video() {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        }
    } else {
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        }
    }
}

/// Engine creating real `RTCPeerConnection`s
pub struct WebRtcMediaEngine {
    api: API,
}

impl WebRtcMediaEngine {
    /// Build the engine with default codecs and interceptors
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = RtcMediaEngine::default();
        media_engine
            .register_default_codecs()
            .context("registering default codecs")
            .map_err(chain_err)?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .context("registering default interceptors")
            .map_err(chain_err)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcMediaEngine {
    async fn create_peer_connection(
        &self,
        role: PeerRole,
        session_id: &SessionId,
        ice_servers: &[IceServer],
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = self.new_peer(role, session_id, ice_servers, signals).await?;
        Ok(peer as Arc<dyn PeerConnection>)
    }
}

impl WebRtcMediaEngine {
    async fn new_peer(
        &self,
        role: PeerRole,
        session_id: &SessionId,
        ice_servers: &[IceServer],
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Result<Arc<WebRtcPeer>, PeerError> {
        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone().unwrap_or_default(),
                    credential: s.credential.clone().unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(engine_err)?,
        );
        let state = Arc::new(Mutex::new(IceState::New));

        let tx = signals.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(json) => {
                        let _ = tx.send(PeerSignal::IceCandidate {
                            role,
                            candidate: IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                            },
                        });
                    }
                    Err(e) => tracing::warn!(%role, error = %e, "Dropping unserializable candidate"),
                }
            })
        }));

        let tx = signals.clone();
        let ice = Arc::clone(&state);
        pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
            let state = ice_state(s);
            *ice.lock() = state;
            tracing::debug!(%role, ?state, "ICE state changed");
            let _ = tx.send(PeerSignal::IceStateChanged { role, state });
            Box::pin(async {})
        }));

        let tx = signals.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let _ = tx.send(PeerSignal::NegotiationNeeded { role });
            Box::pin(async {})
        }));

        if role == PeerRole::Subscriber {
            let tx = signals;
            pc.on_track(Box::new(move |track, _receiver, _transceiver| {
                let stream_id = track.stream_id();
                match parse_stream_id(&stream_id) {
                    Some((session_id, track_type)) => {
                        let _ = tx.send(PeerSignal::RemoteTrack {
                            session_id,
                            track_type,
                            track_id: track.id(),
                        });
                    }
                    None => tracing::debug!(stream_id = %stream_id, "Ignoring unattributed remote track"),
                }
                Box::pin(async {})
            }));
        }

        tracing::debug!(%role, session_id = %session_id, "Peer connection created");
        Ok(Arc::new(WebRtcPeer {
            role,
            session_id: session_id.clone(),
            pc,
            state,
            tracks: Mutex::new(HashMap::new()),
        }))
    }
}

/// Whether a single-encoding sender should carry media: only while the user
/// enabled the track and the SFU keeps its encoding active
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SendFlags {
    enabled: bool,
    encoding_active: bool,
}

impl SendFlags {
    fn sending(self) -> bool {
        self.enabled && self.encoding_active
    }
}

struct LocalTrack {
    track: Arc<TrackLocalStaticSample>,
    sender: Arc<RTCRtpSender>,
    rids: Vec<String>,
    flags: SendFlags,
}

struct WebRtcPeer {
    role: PeerRole,
    session_id: SessionId,
    pc: Arc<RTCPeerConnection>,
    state: Arc<Mutex<IceState>>,
    tracks: Mutex<HashMap<TrackType, LocalTrack>>,
}

impl WebRtcPeer {
    /// Update the send flags of a local track, attaching or detaching its
    /// sample track when that changes whether it sends
    ///
    /// The flags are committed only once the sender accepted the change.
    async fn update_flags(
        &self,
        track_type: TrackType,
        update: impl FnOnce(&[String], &mut SendFlags),
    ) -> Result<(), PeerError> {
        let (track, sender, previous, next) = {
            let tracks = self.tracks.lock();
            let local = tracks
                .get(&track_type)
                .ok_or(PeerError::TrackNotFound(track_type))?;
            let mut next = local.flags;
            update(&local.rids, &mut next);
            (
                Arc::clone(&local.track),
                Arc::clone(&local.sender),
                local.flags,
                next,
            )
        };

        if next.sending() != previous.sending() {
            let replacement = next
                .sending()
                .then(|| track as Arc<dyn TrackLocal + Send + Sync>);
            sender.replace_track(replacement).await.map_err(engine_err)?;
            tracing::debug!(role = %self.role, %track_type, sending = next.sending(), "Sender track replaced");
        }
        if let Some(local) = self.tracks.lock().get_mut(&track_type) {
            local.flags = next;
        }
        Ok(())
    }
}

#[async_trait]
impl PeerConnection for WebRtcPeer {
    async fn add_receive_transceivers(&self) -> Result<(), PeerError> {
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            let init = RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            };
            self.pc
                .add_transceiver_from_kind(kind, Some(init))
                .await
                .map_err(engine_err)?;
        }
        Ok(())
    }

    async fn add_track(&self, track_type: TrackType) -> Result<TrackInfo, PeerError> {
        if self.tracks.lock().contains_key(&track_type) {
            return Err(PeerError::Engine(format!("{track_type} already added")));
        }

        let track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track_type),
            track_type.as_str().to_string(),
            format!("{}:{}", self.session_id, track_type),
        ));
        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(engine_err)?;

        let layers = if track_type.is_video() {
            VideoLayer::single()
        } else {
            Vec::new()
        };
        self.tracks.lock().insert(
            track_type,
            LocalTrack {
                track,
                sender,
                rids: layers.iter().map(|l| l.rid.clone()).collect(),
                flags: SendFlags {
                    enabled: true,
                    encoding_active: true,
                },
            },
        );

        tracing::info!(role = %self.role, %track_type, "Local track added");
        Ok(TrackInfo {
            track_type,
            track_id: track_type.as_str().to_string(),
            layers,
            muted: false,
        })
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<String, PeerError> {
        let options = ice_restart.then(|| RTCOfferOptions {
            ice_restart: true,
            ..Default::default()
        });
        let offer = self.pc.create_offer(options).await.map_err(sdp_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(sdp_err)?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(sdp_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(sdp_err)?;
        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: &str) -> Result<(), PeerError> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(sdp_err)?;
        self.pc.set_remote_description(offer).await.map_err(sdp_err)
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerError> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(sdp_err)?;
        self.pc.set_remote_description(answer).await.map_err(sdp_err)
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: None,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::Ice(e.to_string()))
    }

    async fn set_track_enabled(
        &self,
        track_type: TrackType,
        enabled: bool,
    ) -> Result<(), PeerError> {
        self.update_flags(track_type, |_, flags| flags.enabled = enabled)
            .await?;
        tracing::debug!(role = %self.role, %track_type, enabled, "Track sending toggled");
        Ok(())
    }

    async fn set_active_encodings(
        &self,
        track_type: TrackType,
        rids: &[String],
    ) -> Result<(), PeerError> {
        self.update_flags(track_type, |own, flags| {
            // audio senders have no layers and always keep their encoding
            flags.encoding_active = own.is_empty() || own.iter().any(|rid| rids.contains(rid));
        })
        .await?;
        tracing::debug!(%track_type, ?rids, "Active encodings updated");
        Ok(())
    }

    fn ice_state(&self) -> IceState {
        *self.state.lock()
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.tracks.lock().clear();
        *self.state.lock() = IceState::Closed;
        self.pc.close().await.map_err(engine_err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_stream_id() {
        assert_eq!(
            parse_stream_id("abc-123:screen_share"),
            Some((SessionId("abc-123".into()), TrackType::ScreenShare))
        );
        assert_eq!(parse_stream_id("abc:unknown"), None);
        assert_eq!(parse_stream_id(":audio"), None);
        assert_eq!(parse_stream_id("no-separator"), None);
    }

    #[test]
    fn test_ice_state_mapping() {
        assert_eq!(ice_state(RTCIceConnectionState::Failed), IceState::Failed);
        assert_eq!(ice_state(RTCIceConnectionState::Unspecified), IceState::New);
        assert!(ice_state(RTCIceConnectionState::Completed).is_usable());
    }

    #[tokio::test]
    async fn test_subscriber_offer_has_receive_sections() {
        let engine = WebRtcMediaEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine
            .create_peer_connection(PeerRole::Subscriber, &SessionId::new(), &[], tx)
            .await
            .unwrap();
        pc.add_receive_transceivers().await.unwrap();
        let sdp = pc.create_offer(false).await.unwrap();
        assert!(sdp.contains("m=audio"));
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("recvonly"));
        pc.close().await.unwrap();
        assert_eq!(pc.ice_state(), IceState::Closed);
    }

    #[tokio::test]
    async fn test_publish_quality_pauses_single_encoding_sender() {
        let engine = WebRtcMediaEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine
            .new_peer(PeerRole::Publisher, &SessionId::new(), &[], tx)
            .await
            .unwrap();
        let info = pc.add_track(TrackType::Video).await.unwrap();
        assert_eq!(info.layers.len(), 1);
        let rid = info.layers[0].rid.clone();

        let sender = Arc::clone(&pc.tracks.lock()[&TrackType::Video].sender);
        assert!(sender.track().await.is_some());

        pc.set_active_encodings(TrackType::Video, &[]).await.unwrap();
        assert!(sender.track().await.is_none());

        pc.set_active_encodings(TrackType::Video, &[rid.clone()])
            .await
            .unwrap();
        assert!(sender.track().await.is_some());

        // a muted track stays detached whatever the SFU enables
        pc.set_track_enabled(TrackType::Video, false).await.unwrap();
        pc.set_active_encodings(TrackType::Video, &[rid]).await.unwrap();
        assert!(sender.track().await.is_none());
        pc.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_track_errors() {
        let engine = WebRtcMediaEngine::new().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = engine
            .create_peer_connection(PeerRole::Publisher, &SessionId::new(), &[], tx)
            .await
            .unwrap();
        assert!(matches!(
            pc.set_track_enabled(TrackType::Audio, false).await,
            Err(PeerError::TrackNotFound(TrackType::Audio))
        ));
        pc.close().await.unwrap();
    }
}
